//! Template database repository.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::Template;

const TEMPLATE_COLUMNS: &str = r#"
    id, name, description, os_type, image_id, cpu_cores, ram_mb,
    idle_timeout_minutes, auto_delete_minutes, network_mode, enabled, created_at
"#;

#[derive(Debug, Clone)]
pub struct TemplateRepository {
    pool: SqlitePool,
}

impl TemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, template: &Template) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO templates (
                id, name, description, os_type, image_id, cpu_cores, ram_mb,
                idle_timeout_minutes, auto_delete_minutes, network_mode, enabled, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&template.id)
        .bind(&template.name)
        .bind(&template.description)
        .bind(template.os_type.to_string())
        .bind(&template.image_id)
        .bind(template.cpu_cores)
        .bind(template.ram_mb)
        .bind(template.idle_timeout_minutes)
        .bind(template.auto_delete_minutes)
        .bind(template.network_mode.to_string())
        .bind(template.enabled)
        .bind(template.created_at)
        .execute(&self.pool)
        .await
        .context("creating template")?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Template>> {
        let query = format!("SELECT {} FROM templates WHERE id = ?", TEMPLATE_COLUMNS);
        let template = sqlx::query_as::<_, Template>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching template")?;

        Ok(template)
    }

    /// All templates, newest first.
    pub async fn list(&self) -> Result<Vec<Template>> {
        let query = format!(
            "SELECT {} FROM templates ORDER BY created_at DESC",
            TEMPLATE_COLUMNS
        );
        let templates = sqlx::query_as::<_, Template>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing templates")?;

        Ok(templates)
    }

    /// Templates users may start.
    pub async fn list_enabled(&self) -> Result<Vec<Template>> {
        let query = format!(
            "SELECT {} FROM templates WHERE enabled = 1 ORDER BY name ASC",
            TEMPLATE_COLUMNS
        );
        let templates = sqlx::query_as::<_, Template>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing enabled templates")?;

        Ok(templates)
    }

    pub async fn update(&self, template: &Template) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE templates
            SET name = ?, description = ?, os_type = ?, image_id = ?, cpu_cores = ?, ram_mb = ?,
                idle_timeout_minutes = ?, auto_delete_minutes = ?, network_mode = ?, enabled = ?
            WHERE id = ?
            "#,
        )
        .bind(&template.name)
        .bind(&template.description)
        .bind(template.os_type.to_string())
        .bind(&template.image_id)
        .bind(template.cpu_cores)
        .bind(template.ram_mb)
        .bind(template.idle_timeout_minutes)
        .bind(template.auto_delete_minutes)
        .bind(template.network_mode.to_string())
        .bind(template.enabled)
        .bind(&template.id)
        .execute(&self.pool)
        .await
        .context("updating template")?;

        Ok(())
    }

    /// Returns whether a row was removed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM templates WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting template")?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::template::{NetworkMode, OsType};

    fn template(id: &str, name: &str, enabled: bool) -> Template {
        Template {
            id: id.to_string(),
            name: name.to_string(),
            description: Some("desc".to_string()),
            os_type: OsType::Windows,
            image_id: "img".to_string(),
            cpu_cores: 4,
            ram_mb: 8192,
            idle_timeout_minutes: 45,
            auto_delete_minutes: 10,
            network_mode: NetworkMode::Isolated,
            enabled,
            created_at: 1_000,
        }
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let repo = TemplateRepository::new(db.pool().clone());
        let t = template("t1", "Windows", true);

        repo.create(&t).await.unwrap();
        assert_eq!(repo.get("t1").await.unwrap(), Some(t));
        assert_eq!(repo.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_enabled_filters_disabled() {
        let db = Database::in_memory().await.unwrap();
        let repo = TemplateRepository::new(db.pool().clone());
        repo.create(&template("t1", "B", true)).await.unwrap();
        repo.create(&template("t2", "A", false)).await.unwrap();

        let enabled = repo.list_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "t1");
        assert_eq!(repo.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let db = Database::in_memory().await.unwrap();
        let repo = TemplateRepository::new(db.pool().clone());
        let mut t = template("t1", "Windows", true);
        repo.create(&t).await.unwrap();

        t.enabled = false;
        t.idle_timeout_minutes = 15;
        repo.update(&t).await.unwrap();
        let stored = repo.get("t1").await.unwrap().unwrap();
        assert!(!stored.enabled);
        assert_eq!(stored.idle_timeout_minutes, 15);

        assert!(repo.delete("t1").await.unwrap());
        assert!(!repo.delete("t1").await.unwrap());
    }
}

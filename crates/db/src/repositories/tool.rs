use secrecy::{ExposeSecret, SecretString};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use parley_core::domain::tool::{RequestMethod, ToolDefinition, ToolParameter};

use super::{parse_json, RepositoryError, ToolRepository};
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT
    slug,
    name,
    description,
    parameters_json,
    request_method,
    url,
    auth_token,
    available_in_chat
 FROM tool";

pub struct SqlToolRepository {
    pool: DbPool,
}

impl SqlToolRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ToolRepository for SqlToolRepository {
    async fn upsert(&self, tool: ToolDefinition) -> Result<(), RepositoryError> {
        let parameters_json = serde_json::to_string(&tool.parameters)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;
        sqlx::query(
            "INSERT INTO tool (
                slug,
                name,
                description,
                parameters_json,
                request_method,
                url,
                auth_token,
                available_in_chat
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(slug) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                parameters_json = excluded.parameters_json,
                request_method = excluded.request_method,
                url = excluded.url,
                auth_token = excluded.auth_token,
                available_in_chat = excluded.available_in_chat",
        )
        .bind(&tool.slug)
        .bind(&tool.name)
        .bind(&tool.description)
        .bind(parameters_json)
        .bind(tool.request_method.as_str())
        .bind(&tool.url)
        .bind(tool.auth_token.as_ref().map(|token| token.expose_secret().to_string()))
        .bind(tool.available_in_chat)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_slug(&self, slug: &str) -> Result<Option<ToolDefinition>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE slug = ?"))
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.map(tool_from_row).transpose()
    }

    async fn list_chat_tools(&self) -> Result<Vec<ToolDefinition>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE available_in_chat = 1 ORDER BY slug ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(tool_from_row).collect()
    }
}

fn tool_from_row(row: SqliteRow) -> Result<ToolDefinition, RepositoryError> {
    let method_raw: String = row.get("request_method");
    let request_method = RequestMethod::parse(&method_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown request method `{method_raw}`")))?;

    let parameters: Vec<ToolParameter> =
        parse_json("parameters_json", &row.get::<String, _>("parameters_json"))?;

    Ok(ToolDefinition {
        slug: row.get("slug"),
        name: row.get("name"),
        description: row.get("description"),
        parameters,
        request_method,
        url: row.get("url"),
        auth_token: row.get::<Option<String>, _>("auth_token").map(SecretString::from),
        available_in_chat: row.get("available_in_chat"),
    })
}

use rusqlite::{OptionalExtension, Row, params};
use sha2::{Digest, Sha256};

use super::ConfigStore;
use crate::core::store::types::{ApiTokenRecord, TokenScope};
use crate::error::FleetResult;

const TOKEN_PREFIX: &str = "bfk_";
const TOKEN_COLUMNS: &str = "id, name, scope, created_at, last_used_at";

fn digest(raw_token: &str) -> String {
    hex::encode(Sha256::digest(raw_token.as_bytes()))
}

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<ApiTokenRecord> {
    let scope: String = row.get(2)?;
    Ok(ApiTokenRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        // Unknown scopes get the narrower rights.
        scope: TokenScope::parse(&scope).unwrap_or(TokenScope::ReadOnly),
        created_at: row.get(3)?,
        last_used_at: row.get(4)?,
    })
}

impl ConfigStore {
    /// Issues a token for the admin API. The raw value is returned once and
    /// only its digest is kept.
    pub async fn issue_api_token(
        &self,
        name: &str,
        scope: TokenScope,
    ) -> FleetResult<(String, ApiTokenRecord)> {
        let raw_token = format!("{TOKEN_PREFIX}{}", hex::encode(rand::random::<[u8; 20]>()));
        let id = uuid::Uuid::new_v4().to_string();

        let db = self.db.lock().await;
        let record = db.query_row(
            &format!(
                "INSERT INTO api_tokens (id, name, token_hash, scope) VALUES (?1, ?2, ?3, ?4)
                 RETURNING {TOKEN_COLUMNS}"
            ),
            params![id, name, digest(&raw_token), scope.as_str()],
            token_from_row,
        )?;
        Ok((raw_token, record))
    }

    pub async fn list_api_tokens(&self) -> FleetResult<Vec<ApiTokenRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {TOKEN_COLUMNS} FROM api_tokens ORDER BY created_at DESC, name"
        ))?;
        let rows = stmt.query_map([], token_from_row)?;
        let mut tokens = Vec::new();
        for row in rows {
            tokens.push(row?);
        }
        Ok(tokens)
    }

    pub async fn revoke_api_token(&self, id: &str) -> FleetResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute("DELETE FROM api_tokens WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// Looks up the token a bearer value belongs to and stamps its
    /// `last_used_at`. Values without the token prefix never hit the database.
    pub async fn authenticate_api_token(&self, raw_token: &str) -> FleetResult<Option<ApiTokenRecord>> {
        if !raw_token.starts_with(TOKEN_PREFIX) {
            return Ok(None);
        }
        let db = self.db.lock().await;
        let record = db
            .query_row(
                &format!(
                    "UPDATE api_tokens SET last_used_at = CURRENT_TIMESTAMP
                     WHERE token_hash = ?1 RETURNING {TOKEN_COLUMNS}"
                ),
                params![digest(raw_token)],
                token_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub async fn has_any_api_tokens(&self) -> FleetResult<bool> {
        let db = self.db.lock().await;
        let found: bool =
            db.query_row("SELECT EXISTS(SELECT 1 FROM api_tokens)", [], |row| row.get(0))?;
        Ok(found)
    }
}

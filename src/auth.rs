//! Identity glue. Authentication itself lives in an external collaborator;
//! by the time a request reaches this service its auth proxy has resolved
//! the session and injected the stable opaque user id as a header. First
//! sight of an id provisions a `client` profile; roles are read back from
//! the profile row on every request and never escalated here.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::api::AppState;
use crate::error::StoreError;
use crate::realtime::tables;
use crate::responses::{RequestMeta, new_meta};
use crate::store::Store;
use crate::types::{Profile, Role};

pub const USER_ID_HEADER: &str = "x-user-id";

/// The resolved caller, attached to request extensions by the middleware.
#[derive(Debug, Clone, Copy)]
pub struct AuthedUser {
    pub id: Uuid,
    pub role: Role,
}

impl AuthedUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> Result<(), StoreError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(StoreError::Forbidden)
        }
    }
}

pub async fn auth_middleware(
    State(st): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let meta = req
        .extensions()
        .get::<RequestMeta>()
        .cloned()
        .unwrap_or_else(new_meta);

    let header = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok());
    let Some(user_id) = header.and_then(|v| Uuid::parse_str(v.trim()).ok()) else {
        return StoreError::Unauthorized("missing or malformed identity header")
            .with_meta(meta)
            .into_response();
    };

    match ensure_profile(&st.store, user_id).await {
        Ok(profile) => {
            req.extensions_mut().insert(AuthedUser {
                id: profile.id,
                role: profile.role,
            });
            next.run(req).await
        }
        Err(e) => e.with_meta(meta).into_response(),
    }
}

pub(crate) async fn ensure_profile(store: &Store, user_id: Uuid) -> Result<Profile, StoreError> {
    let inserted = sqlx::query("INSERT INTO profiles (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
        .bind(user_id)
        .execute(&store.pool)
        .await?;

    let profile = sqlx::query_as::<_, Profile>(
        "SELECT id, role, display_name, created_at FROM profiles WHERE id = $1",
    )
    .bind(user_id)
    .fetch_one(&store.pool)
    .await?;

    if inserted.rows_affected() == 1 {
        store.feed.inserted(tables::PROFILES, &profile);
    }
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_admins_pass_the_gate() {
        let admin = AuthedUser {
            id: Uuid::new_v4(),
            role: Role::Admin,
        };
        let client = AuthedUser {
            id: Uuid::new_v4(),
            role: Role::Client,
        };
        assert!(admin.require_admin().is_ok());
        assert!(matches!(
            client.require_admin(),
            Err(StoreError::Forbidden)
        ));
    }
}

use anyhow::{Context, Result};

use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::models::User;
use crate::store::UserStore;

/// Users are provisioned by the external auth service; the admin
/// account is the one row this service seeds itself.
pub(crate) async fn ensure_admin_user(state: &AppState) -> Result<()> {
    let admin = state.settings().admin();

    if state
        .store()
        .find_user(&admin.admin_user_id)
        .await
        .context("Failed to look up admin user")?
        .is_some()
    {
        return Ok(());
    }

    let now = primitive_now_utc();
    let user = User {
        id: admin.admin_user_id.clone(),
        display_name: admin.admin_display_name.clone(),
        credit_balance: admin.admin_starting_credits,
        is_active: true,
        is_admin: true,
        created_at: now,
        updated_at: now,
    };

    state.store().insert_user(&user).await.context("Failed to seed admin user")?;
    tracing::info!(user_id = %user.id, "Seeded admin user");

    Ok(())
}

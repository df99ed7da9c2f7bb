use sqlx::SqlitePool;

use crate::db::models::UserRow;

/// Insert a new user with an already-hashed password. Returns the row id.
pub async fn create_user(
    pool: &SqlitePool,
    username: &str,
    hashed_password: &str,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query("INSERT INTO users (username, hashed_password) VALUES (?, ?)")
        .bind(username)
        .bind(hashed_password)
        .execute(pool)
        .await?;
    Ok(result.last_insert_rowid())
}

pub async fn get_by_username(
    pool: &SqlitePool,
    username: &str,
) -> Result<Option<UserRow>, sqlx::Error> {
    sqlx::query_as::<_, UserRow>(
        "SELECT id, username, hashed_password, is_suspended, created_at \
         FROM users WHERE username = ?",
    )
    .bind(username)
    .fetch_optional(pool)
    .await
}

pub async fn set_suspended(
    pool: &SqlitePool,
    username: &str,
    suspended: bool,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE users SET is_suspended = ? WHERE username = ?")
        .bind(suspended)
        .bind(username)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::{memory_pool, run_migrations};

    async fn test_pool() -> SqlitePool {
        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn create_and_fetch_user() {
        let pool = test_pool().await;
        let id = create_user(&pool, "alice", "hash").await.unwrap();

        let user = get_by_username(&pool, "alice").await.unwrap().unwrap();
        assert_eq!(user.id, id);
        assert_eq!(user.hashed_password, "hash");
        assert!(!user.is_suspended);

        assert!(get_by_username(&pool, "bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_usernames_are_rejected() {
        let pool = test_pool().await;
        create_user(&pool, "alice", "h1").await.unwrap();
        assert!(create_user(&pool, "alice", "h2").await.is_err());
    }

    #[tokio::test]
    async fn suspension_flag_roundtrips() {
        let pool = test_pool().await;
        create_user(&pool, "alice", "hash").await.unwrap();

        assert!(set_suspended(&pool, "alice", true).await.unwrap());
        assert!(get_by_username(&pool, "alice").await.unwrap().unwrap().is_suspended);
        assert!(!set_suspended(&pool, "ghost", true).await.unwrap());
    }
}

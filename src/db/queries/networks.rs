use sqlx::SqlitePool;

use crate::db::models::NetworkRow;
use crate::session::network::NetworkConfig;

fn encode_list(list: &[String]) -> String {
    serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
}

/// Insert a network configuration for a user. Returns the new row id.
pub async fn add_network(pool: &SqlitePool, config: &NetworkConfig) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO irc_networks (user_id, network_name, hostname, port, use_ssl, \
         server_password, auto_reconnect, modules, perform_commands, initial_channels, \
         nickname, alt_nickname, ident, realname, quit_message) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(config.user_id)
    .bind(&config.network_name)
    .bind(&config.hostname)
    .bind(config.port as i64)
    .bind(config.use_ssl)
    .bind(&config.server_password)
    .bind(config.auto_reconnect)
    .bind(encode_list(&config.modules))
    .bind(encode_list(&config.perform_commands))
    .bind(encode_list(&config.initial_channels))
    .bind(&config.nickname)
    .bind(&config.alt_nickname)
    .bind(&config.ident)
    .bind(&config.realname)
    .bind(&config.quit_message)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

const SELECT_COLUMNS: &str = "id, user_id, network_name, hostname, port, use_ssl, \
     server_password, auto_reconnect, modules, perform_commands, initial_channels, \
     nickname, alt_nickname, ident, realname, quit_message";

/// All network configurations belonging to a user.
pub async fn list_networks(
    pool: &SqlitePool,
    user_id: i64,
) -> Result<Vec<NetworkConfig>, sqlx::Error> {
    let rows = sqlx::query_as::<_, NetworkRow>(&format!(
        "SELECT {SELECT_COLUMNS} FROM irc_networks WHERE user_id = ? ORDER BY id"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(NetworkRow::into_config).collect())
}

/// One network configuration, scoped to its owner.
pub async fn get_network(
    pool: &SqlitePool,
    user_id: i64,
    network_id: i64,
) -> Result<Option<NetworkConfig>, sqlx::Error> {
    let row = sqlx::query_as::<_, NetworkRow>(&format!(
        "SELECT {SELECT_COLUMNS} FROM irc_networks WHERE user_id = ? AND id = ?"
    ))
    .bind(user_id)
    .bind(network_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(NetworkRow::into_config))
}

/// Update a network configuration in place. Returns false when no row
/// matched (wrong id or wrong owner).
pub async fn update_network(pool: &SqlitePool, config: &NetworkConfig) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE irc_networks SET network_name = ?, hostname = ?, port = ?, use_ssl = ?, \
         server_password = ?, auto_reconnect = ?, modules = ?, perform_commands = ?, \
         initial_channels = ?, nickname = ?, alt_nickname = ?, ident = ?, realname = ?, \
         quit_message = ? WHERE id = ? AND user_id = ?",
    )
    .bind(&config.network_name)
    .bind(&config.hostname)
    .bind(config.port as i64)
    .bind(config.use_ssl)
    .bind(&config.server_password)
    .bind(config.auto_reconnect)
    .bind(encode_list(&config.modules))
    .bind(encode_list(&config.perform_commands))
    .bind(encode_list(&config.initial_channels))
    .bind(&config.nickname)
    .bind(&config.alt_nickname)
    .bind(&config.ident)
    .bind(&config.realname)
    .bind(&config.quit_message)
    .bind(config.id)
    .bind(config.user_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_network(
    pool: &SqlitePool,
    user_id: i64,
    network_id: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM irc_networks WHERE id = ? AND user_id = ?")
        .bind(network_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::{memory_pool, run_migrations};
    use crate::db::queries::users::create_user;

    async fn test_pool() -> (SqlitePool, i64) {
        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();
        let user_id = create_user(&pool, "alice", "hash").await.unwrap();
        (pool, user_id)
    }

    fn config(user_id: i64, name: &str) -> NetworkConfig {
        NetworkConfig {
            id: 0,
            user_id,
            network_name: name.into(),
            hostname: "irc.example.org".into(),
            port: 6697,
            use_ssl: true,
            server_password: "secret".into(),
            auto_reconnect: true,
            modules: vec!["sasl".into()],
            perform_commands: vec!["MODE alice +i".into()],
            initial_channels: vec!["#lobby".into()],
            nickname: "alice".into(),
            alt_nickname: "alice_".into(),
            ident: "alice".into(),
            realname: "Alice".into(),
            quit_message: "bye".into(),
        }
    }

    #[tokio::test]
    async fn crud_roundtrip() {
        let (pool, user_id) = test_pool().await;

        let id = add_network(&pool, &config(user_id, "libera")).await.unwrap();
        let mut loaded = get_network(&pool, user_id, id).await.unwrap().unwrap();
        assert_eq!(loaded.network_name, "libera");
        assert_eq!(loaded.modules, vec!["sasl"]);
        assert_eq!(loaded.initial_channels, vec!["#lobby"]);
        assert_eq!(loaded.port, 6697);

        loaded.hostname = "irc.other.org".into();
        loaded.auto_reconnect = false;
        assert!(update_network(&pool, &loaded).await.unwrap());
        let updated = get_network(&pool, user_id, id).await.unwrap().unwrap();
        assert_eq!(updated.hostname, "irc.other.org");
        assert!(!updated.auto_reconnect);

        assert!(delete_network(&pool, user_id, id).await.unwrap());
        assert!(get_network(&pool, user_id, id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rows_are_scoped_to_their_owner() {
        let (pool, user_id) = test_pool().await;
        let other = create_user(&pool, "bob", "hash").await.unwrap();

        let id = add_network(&pool, &config(user_id, "libera")).await.unwrap();
        assert!(get_network(&pool, other, id).await.unwrap().is_none());
        assert!(!delete_network(&pool, other, id).await.unwrap());
        assert_eq!(list_networks(&pool, user_id).await.unwrap().len(), 1);
        assert!(list_networks(&pool, other).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn network_name_unique_per_user() {
        let (pool, user_id) = test_pool().await;
        add_network(&pool, &config(user_id, "libera")).await.unwrap();
        assert!(add_network(&pool, &config(user_id, "libera")).await.is_err());

        let other = create_user(&pool, "bob", "hash").await.unwrap();
        assert!(add_network(&pool, &config(other, "libera")).await.is_ok());
    }
}

//! Application schema creation on a freshly installed SQL tier.

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder};
use tracing::{debug, info};

use tidbop_state::Schema;

use crate::error::{ControllerError, ControllerResult};
use crate::naming::TIDB_PORT;

/// Creates the application database, user and grants.
#[async_trait]
pub trait SchemaInitializer: Send + Sync {
    /// `endpoint` is the SQL tier's `host:port`.
    async fn initialize(&self, endpoint: &str, schema: &Schema) -> ControllerResult<()>;
}

/// The statements run as root for `schema`, in order.
///
/// Names and passwords were validated on save, so quoting is safe.
pub fn init_statements(schema: &Schema) -> Vec<String> {
    let Schema {
        name,
        user,
        password,
    } = schema;
    vec![
        format!("CREATE DATABASE IF NOT EXISTS `{name}`"),
        "DELETE FROM mysql.user WHERE User = ''".to_string(),
        format!("CREATE USER IF NOT EXISTS '{user}'@'%' IDENTIFIED BY '{password}'"),
        format!("GRANT ALL PRIVILEGES ON `{name}`.* TO '{user}'@'%'"),
        "FLUSH PRIVILEGES".to_string(),
    ]
}

/// mysql_async-backed [`SchemaInitializer`] connecting as the SQL root user.
#[derive(Debug, Clone)]
pub struct MysqlSchemaInitializer {
    user: String,
    password: Option<String>,
}

impl Default for MysqlSchemaInitializer {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            password: None,
        }
    }
}

impl MysqlSchemaInitializer {
    pub fn with_credentials(user: &str, password: Option<String>) -> Self {
        Self {
            user: user.to_string(),
            password,
        }
    }

    fn opts(&self, endpoint: &str) -> ControllerResult<OptsBuilder> {
        let (host, port) = match endpoint.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    ControllerError::Validation(format!("bad SQL endpoint {endpoint}: {e}"))
                })?;
                (host.to_string(), port)
            }
            None => (endpoint.to_string(), TIDB_PORT),
        };
        Ok(OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port)
            .user(Some(self.user.clone()))
            .pass(self.password.clone())
            .db_name(Some("mysql")))
    }
}

fn sql_err(e: mysql_async::Error) -> ControllerError {
    ControllerError::Sql(e.to_string())
}

#[async_trait]
impl SchemaInitializer for MysqlSchemaInitializer {
    async fn initialize(&self, endpoint: &str, schema: &Schema) -> ControllerResult<()> {
        let mut conn = Conn::new(self.opts(endpoint)?).await.map_err(sql_err)?;
        for statement in init_statements(schema) {
            debug!(%endpoint, "running schema statement");
            conn.query_drop(statement).await.map_err(sql_err)?;
        }
        conn.disconnect().await.map_err(sql_err)?;
        info!(%endpoint, database = %schema.name, user = %schema.user, "schema initialized");
        Ok(())
    }
}

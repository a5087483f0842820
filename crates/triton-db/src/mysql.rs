//! MySQL-backed implementation of the database seam.
//!
//! `mysql_async` is driven from the daemon's synchronous worker thread
//! through an owned current-thread tokio runtime; the worker is the only
//! caller, so every `block_on` runs the driver itself.

use std::sync::Arc;

use mysql_async::prelude::Queryable;

use crate::config::DbConfig;
use crate::connection::{Connection, Connector, DbValue, Row};
use crate::error::{DbError, DbResult};

/// Production [`Connector`] over `mysql_async`.
pub struct MySqlConnector {
    runtime: Arc<tokio::runtime::Runtime>,
}

impl MySqlConnector {
    pub fn new() -> DbResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DbError::Connect(format!("failed to build runtime: {e}")))?;
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }
}

impl Connector for MySqlConnector {
    fn connect(&self, config: &DbConfig) -> DbResult<Box<dyn Connection>> {
        let (host, port) = parse_endpoint(&config.server)?;
        let opts = mysql_async::OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port)
            .user(Some(config.username.clone()))
            .pass(Some(config.password.clone()))
            .db_name(Some(config.schema.clone()));

        let conn = self.runtime.block_on(mysql_async::Conn::new(opts))?;
        Ok(Box::new(MySqlConnection {
            runtime: Arc::clone(&self.runtime),
            conn,
        }))
    }
}

struct MySqlConnection {
    runtime: Arc<tokio::runtime::Runtime>,
    conn: mysql_async::Conn,
}

impl Connection for MySqlConnection {
    fn execute(&mut self, stmt: &str) -> DbResult<u64> {
        self.runtime.block_on(self.conn.query_drop(stmt))?;
        Ok(self.conn.affected_rows())
    }

    fn query(&mut self, stmt: &str) -> DbResult<Vec<Row>> {
        let rows: Vec<mysql_async::Row> = self.runtime.block_on(self.conn.query(stmt))?;
        Ok(rows.into_iter().map(row_from_mysql).collect())
    }
}

impl From<mysql_async::Error> for DbError {
    fn from(e: mysql_async::Error) -> Self {
        match e {
            mysql_async::Error::Server(s) => DbError::Server {
                code: s.code,
                state: s.state,
                message: s.message,
            },
            mysql_async::Error::Url(u) => DbError::Connect(u.to_string()),
            other => DbError::Io(other.to_string()),
        }
    }
}

/// Accepts `tcp://host:port`, `mysql://host:port`, or bare `host[:port]`;
/// the port defaults to 3306.
fn parse_endpoint(server: &str) -> DbResult<(String, u16)> {
    let without_scheme = server
        .split_once("://")
        .map_or(server, |(_, rest)| rest);
    if without_scheme.is_empty() {
        return Err(DbError::Connect(format!("invalid server endpoint `{server}`")));
    }

    match without_scheme.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| DbError::Connect(format!("invalid port in `{server}`")))?;
            Ok((host.to_owned(), port))
        }
        None => Ok((without_scheme.to_owned(), 3306)),
    }
}

fn row_from_mysql(row: mysql_async::Row) -> Row {
    let columns = row.columns();
    let mut out = Vec::with_capacity(columns.len());
    for (index, column) in columns.iter().enumerate() {
        let value = row
            .as_ref(index)
            .cloned()
            .unwrap_or(mysql_async::Value::NULL);
        out.push((column.name_str().into_owned(), value_from_mysql(value)));
    }
    Row::new(out)
}

fn value_from_mysql(value: mysql_async::Value) -> DbValue {
    use mysql_async::Value;

    match value {
        Value::NULL => DbValue::Null,
        Value::Int(n) => DbValue::Int(n),
        Value::UInt(n) => DbValue::UInt(n),
        Value::Float(f) => DbValue::Double(f64::from(f)),
        Value::Double(f) => DbValue::Double(f),
        Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => DbValue::Text(text),
            Err(e) => DbValue::Bytes(e.into_bytes()),
        },
        Value::Date(year, month, day, hour, minute, second, micros) => DbValue::Text(format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
        )),
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if negative { "-" } else { "" };
            let hours = u32::from(hours) + days * 24;
            DbValue::Text(format!(
                "{sign}{hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
            ))
        }
    }
}

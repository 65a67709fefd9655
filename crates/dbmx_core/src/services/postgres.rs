//! PostgreSQL handle backed by a deadpool-postgres pool.

use crate::error::{DbmxError, Result};
use crate::models::{BackendKind, ConnectionDescriptor, QueryHandle, QueryType, StatementOutcome};
use crate::services::connection::{bytes_to_hex, DatabaseHandle, PoolSettings};

use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::{Manager, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime};
use serde_json::Value as JsonValue;
use std::net::IpAddr;
use std::time::Duration;
use tokio::select;
use tokio_postgres::types::{FromSql, Kind, ToSql, Type};
use tokio_postgres::NoTls;
use uuid::Uuid;

type BoxedParam = Box<dyn ToSql + Sync + Send>;
type DecodeError = Box<dyn std::error::Error + Sync + Send>;

/// A pool of connections for a single saved PostgreSQL connection.
pub struct PostgresHandle {
    /// Identifier of the saved connection
    id: Uuid,
    /// The actual connection pool
    pool: Pool,
}

impl PostgresHandle {
    /// Build the pool and validate it with a test connection.
    pub async fn connect(descriptor: &ConnectionDescriptor, settings: PoolSettings) -> Result<Self> {
        let connect_timeout = Duration::from_secs(u64::from(descriptor.options.connect_timeout_secs));

        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(&descriptor.host);
        pg_config.port(descriptor.port);
        pg_config.dbname(&descriptor.database);
        pg_config.user(&descriptor.username);
        pg_config.password(&descriptor.password);
        pg_config.application_name(&descriptor.options.application_name);
        pg_config.connect_timeout(connect_timeout);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(60));

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Fast },
        );

        let pool = Pool::builder(manager)
            .max_size(settings.max_size)
            .wait_timeout(Some(settings.wait_timeout))
            .create_timeout(Some(connect_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| DbmxError::connect(format!("Failed to create pool: {e}")))?;

        // Validate credentials and reachability up front
        let client = pool.get().await.map_err(connect_error)?;
        client
            .execute("SELECT 1", &[])
            .await
            .map_err(|e| DbmxError::connect(format!("Connection validation failed: {e}")))?;

        tracing::info!(
            connection_id = %descriptor.id,
            host = %descriptor.host,
            database = %descriptor.database,
            "PostgreSQL pool created"
        );

        Ok(Self { id: descriptor.id, pool })
    }

    async fn run(
        client: &tokio_postgres::Client,
        sql: &str,
        params: &[JsonValue],
    ) -> Result<StatementOutcome> {
        let statement = client.prepare(sql).await?;

        let bound = bind_params(params, statement.params())?;
        let refs: Vec<&(dyn ToSql + Sync)> =
            bound.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

        if statement.columns().is_empty() {
            let affected = client.execute(&statement, &refs).await?;
            return Ok(StatementOutcome::affected(affected));
        }

        let columns = statement.columns().iter().map(|c| c.name().to_string()).collect();
        let rows = client.query(&statement, &refs).await?;
        let mut outcome = StatementOutcome::rows(columns, rows.iter().map(row_to_json).collect());
        // DML with RETURNING yields one row per changed row
        if QueryType::detect(sql) != QueryType::Select {
            outcome.rows_affected = rows.len() as u64;
        }
        Ok(outcome)
    }
}

#[async_trait]
impl DatabaseHandle for PostgresHandle {
    fn connection_id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn execute(
        &self,
        sql: &str,
        params: &[JsonValue],
        query: &QueryHandle,
    ) -> Result<StatementOutcome> {
        let client = self.pool.get().await.map_err(connect_error)?;
        let cancel_token = client.cancel_token();

        select! {
            result = Self::run(&client, sql, params) => result,
            _ = query.cancelled() => {
                if let Err(e) = cancel_token.cancel_query(NoTls).await {
                    tracing::warn!(query_id = %query.id(), error = %e, "Failed to send cancel request");
                }
                Err(DbmxError::cancelled(query.id()))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.pool.is_closed() {
            self.pool.close();
            tracing::info!(connection_id = %self.id, "PostgreSQL pool closed");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// Classify pool acquisition failures as connect errors.
fn connect_error(err: PoolError) -> DbmxError {
    match err {
        PoolError::Backend(ref pg) => match pg.as_db_error() {
            Some(db) if db.code().code().starts_with("28") => {
                DbmxError::connect_with_hint(db.message().to_string(), "Check username and password")
            }
            _ => DbmxError::connect(format!("Failed to establish connection: {pg}")),
        },
        PoolError::Timeout(kind) => {
            DbmxError::connect(format!("Timed out acquiring connection ({kind:?})"))
        }
        PoolError::Closed => DbmxError::connect("Connection pool is closed"),
        other => DbmxError::connect(format!("Failed to acquire connection: {other}")),
    }
}

/// Coerce JSON parameters to the types the prepared statement expects.
fn bind_params(params: &[JsonValue], types: &[Type]) -> Result<Vec<BoxedParam>> {
    if params.len() != types.len() {
        return Err(DbmxError::execute(format!(
            "Statement expects {} parameter(s) but {} were supplied",
            types.len(),
            params.len()
        )));
    }

    params.iter().zip(types).enumerate().map(|(i, (value, ty))| bind_param(i, value, ty)).collect()
}

fn bind_param(index: usize, value: &JsonValue, ty: &Type) -> Result<BoxedParam> {
    let mismatch = || {
        DbmxError::execute(format!(
            "Parameter ${}: cannot convert {} to {}",
            index + 1,
            value,
            ty.name()
        ))
    };

    let boxed: BoxedParam = match *ty {
        Type::BOOL => Box::new(json_bool(value).ok_or_else(mismatch)?),
        Type::INT2 => {
            let v = json_i64(value).ok_or_else(mismatch)?;
            Box::new(v.map(i16::try_from).transpose().map_err(|_| mismatch())?)
        }
        Type::INT4 => {
            let v = json_i64(value).ok_or_else(mismatch)?;
            Box::new(v.map(i32::try_from).transpose().map_err(|_| mismatch())?)
        }
        Type::INT8 => Box::new(json_i64(value).ok_or_else(mismatch)?),
        Type::FLOAT4 => Box::new(json_f64(value).ok_or_else(mismatch)?.map(|v| v as f32)),
        Type::FLOAT8 => Box::new(json_f64(value).ok_or_else(mismatch)?),
        Type::JSON | Type::JSONB => {
            Box::new(if value.is_null() { None } else { Some(value.clone()) })
        }
        Type::UUID => {
            let parsed = match value {
                JsonValue::Null => None,
                JsonValue::String(s) => Some(Uuid::parse_str(s).map_err(|_| mismatch())?),
                _ => return Err(mismatch()),
            };
            Box::new(parsed)
        }
        // Text-like types; anything else is rejected by the driver at bind time
        _ => Box::new(json_text(value)),
    };
    Ok(boxed)
}

/// `None` = not convertible, `Some(None)` = SQL NULL.
fn json_bool(value: &JsonValue) -> Option<Option<bool>> {
    match value {
        JsonValue::Null => Some(None),
        JsonValue::Bool(b) => Some(Some(*b)),
        JsonValue::String(s) => s.parse().ok().map(Some),
        _ => None,
    }
}

fn json_i64(value: &JsonValue) -> Option<Option<i64>> {
    match value {
        JsonValue::Null => Some(None),
        JsonValue::Number(n) => n.as_i64().map(Some),
        JsonValue::String(s) => s.trim().parse().ok().map(Some),
        _ => None,
    }
}

fn json_f64(value: &JsonValue) -> Option<Option<f64>> {
    match value {
        JsonValue::Null => Some(None),
        JsonValue::Number(n) => n.as_f64().map(Some),
        JsonValue::String(s) => s.trim().parse().ok().map(Some),
        _ => None,
    }
}

fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Convert a PostgreSQL row to JSON values.
fn row_to_json(row: &tokio_postgres::Row) -> Vec<JsonValue> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| match *col.type_() {
            Type::BOOL => get_or_null(row, i, JsonValue::Bool),
            Type::INT2 => get_or_null(row, i, |v: i16| JsonValue::Number(v.into())),
            Type::INT4 => get_or_null(row, i, |v: i32| JsonValue::Number(v.into())),
            Type::INT8 => get_or_null(row, i, |v: i64| JsonValue::Number(v.into())),
            Type::OID => get_or_null(row, i, |v: u32| JsonValue::Number(v.into())),
            Type::FLOAT4 => get_or_null(row, i, |v: f32| float_to_json(f64::from(v))),
            Type::FLOAT8 => get_or_null(row, i, float_to_json),
            Type::UUID => get_or_null(row, i, |v: Uuid| JsonValue::String(v.to_string())),
            Type::JSON | Type::JSONB => get_or_null(row, i, |v: JsonValue| v),
            Type::TIMESTAMPTZ => {
                get_or_null(row, i, |v: chrono::DateTime<Utc>| JsonValue::String(v.to_rfc3339()))
            }
            Type::TIMESTAMP => {
                get_or_null(row, i, |v: chrono::NaiveDateTime| JsonValue::String(v.to_string()))
            }
            Type::DATE => {
                get_or_null(row, i, |v: chrono::NaiveDate| JsonValue::String(v.to_string()))
            }
            Type::TIME => {
                get_or_null(row, i, |v: chrono::NaiveTime| JsonValue::String(v.to_string()))
            }
            Type::BYTEA => get_or_null(row, i, |v: Vec<u8>| JsonValue::String(bytes_to_hex(&v))),
            Type::INT4_ARRAY => get_or_null(row, i, |v: Vec<i32>| {
                JsonValue::Array(v.into_iter().map(|x| JsonValue::Number(x.into())).collect())
            }),
            Type::INT8_ARRAY => get_or_null(row, i, |v: Vec<i64>| {
                JsonValue::Array(v.into_iter().map(|x| JsonValue::Number(x.into())).collect())
            }),
            Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => get_or_null(row, i, |v: Vec<String>| {
                JsonValue::Array(v.into_iter().map(JsonValue::String).collect())
            }),
            Type::INET => get_or_null(row, i, |v: IpAddr| JsonValue::String(v.to_string())),
            ref ty if <String as FromSql>::accepts(ty) => get_or_null(row, i, JsonValue::String),
            _ => get_or_null(row, i, |v: WireText| JsonValue::String(v.0)),
        })
        .collect()
}

fn get_or_null<'a, T, F>(row: &'a tokio_postgres::Row, index: usize, convert: F) -> JsonValue
where
    T: tokio_postgres::types::FromSql<'a>,
    F: FnOnce(T) -> JsonValue,
{
    row.try_get::<_, Option<T>>(index).ok().flatten().map(convert).unwrap_or(JsonValue::Null)
}

fn float_to_json(value: f64) -> JsonValue {
    serde_json::Number::from_f64(value).map(JsonValue::Number).unwrap_or(JsonValue::Null)
}

/// Text rendering of a value with no dedicated decoder.
///
/// NUMERIC keeps every digit, INTERVAL and MONEY are rendered the way psql
/// shows them, enums and extension types pass through as text, and anything
/// else is the hex form of its binary encoding.
struct WireText(String);

impl<'a> FromSql<'a> for WireText {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, DecodeError> {
        let text = match *ty {
            Type::NUMERIC => numeric_to_string(raw)?,
            Type::INTERVAL => interval_to_string(raw)?,
            Type::MONEY => money_to_string(raw)?,
            _ if is_textual(ty) => std::str::from_utf8(raw)?.to_string(),
            _ => bytes_to_hex(raw),
        };
        Ok(Self(text))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

fn is_textual(ty: &Type) -> bool {
    match ty.kind() {
        Kind::Enum(_) => true,
        // Extension types such as citext send their text form
        Kind::Simple => Type::from_oid(ty.oid()).is_none(),
        _ => false,
    }
}

fn be_u16(raw: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([raw[at], raw[at + 1]])
}

/// Render a binary NUMERIC (base-10000 digit groups) as exact decimal text.
fn numeric_to_string(raw: &[u8]) -> std::result::Result<String, DecodeError> {
    if raw.len() < 8 {
        return Err("NUMERIC value is truncated".into());
    }
    let ndigits = usize::from(be_u16(raw, 0));
    let weight = i32::from(be_u16(raw, 2) as i16);
    let sign = be_u16(raw, 4);
    let dscale = usize::from(be_u16(raw, 6));

    match sign {
        0x0000 | 0x4000 => {}
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        other => return Err(format!("NUMERIC value has unknown sign {other:#06x}").into()),
    }
    if raw.len() < 8 + ndigits * 2 {
        return Err("NUMERIC value is truncated".into());
    }

    let digits: Vec<u16> = (0..ndigits).map(|i| be_u16(raw, 8 + i * 2)).collect();
    if digits.iter().any(|&d| d > 9999) {
        return Err("NUMERIC digit group out of range".into());
    }
    let group = |index: i32| -> u16 {
        usize::try_from(index).ok().and_then(|i| digits.get(i).copied()).unwrap_or(0)
    };

    let mut text = String::new();
    if sign == 0x4000 {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&group(0).to_string());
        for index in 1..=weight {
            text.push_str(&format!("{:04}", group(index)));
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut index = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", group(index)));
            index += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }

    Ok(text)
}

/// Render a binary INTERVAL (microseconds, days, months).
fn interval_to_string(raw: &[u8]) -> std::result::Result<String, DecodeError> {
    if raw.len() != 16 {
        return Err("INTERVAL value has the wrong length".into());
    }
    let micros = i64::from_be_bytes(<[u8; 8]>::try_from(&raw[0..8])?);
    let days = i32::from_be_bytes(<[u8; 4]>::try_from(&raw[8..12])?);
    let months = i32::from_be_bytes(<[u8; 4]>::try_from(&raw[12..16])?);

    let unit = |n: i32, singular: &str| {
        format!("{n} {singular}{}", if n.abs() == 1 { "" } else { "s" })
    };

    let mut parts = Vec::new();
    if months / 12 != 0 {
        parts.push(unit(months / 12, "year"));
    }
    if months % 12 != 0 {
        parts.push(unit(months % 12, "mon"));
    }
    if days != 0 {
        parts.push(unit(days, "day"));
    }
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 { "-" } else { "" };
        let total = micros.unsigned_abs();
        let secs = total / 1_000_000;
        let mut clock =
            format!("{sign}{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60);
        let frac = total % 1_000_000;
        if frac != 0 {
            clock.push('.');
            clock.push_str(format!("{frac:06}").trim_end_matches('0'));
        }
        parts.push(clock);
    }

    Ok(parts.join(" "))
}

/// Render a binary MONEY (cents) without a currency symbol.
fn money_to_string(raw: &[u8]) -> std::result::Result<String, DecodeError> {
    let cents = i64::from_be_bytes(<[u8; 8]>::try_from(raw)?);
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    Ok(format!("{sign}{}.{:02}", abs / 100, abs % 100))
}

// ABOUTME: Coerces transformed JSON values to the target table's introspected column types
// ABOUTME: A coercion failure fails only the row it belongs to

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use super::{ColumnType, PreparedRow, SqlValue, TableSchema};

/// Build a bindable row from transformed columns.
///
/// `id` is always written. Columns the table does not have are dropped with a debug
/// log. `created_at`/`updated_at` are stamped when the table carries them.
pub fn prepare_row<'a, I>(
    table: &str,
    schema: &TableSchema,
    id: &str,
    columns: I,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
) -> Result<PreparedRow>
where
    I: IntoIterator<Item = (&'a str, &'a Value)>,
{
    let id_type = schema
        .get("id")
        .copied()
        .ok_or_else(|| anyhow!("table '{}' has no 'id' column", table))?;

    let mut values = indexmap::IndexMap::new();
    values.insert(
        "id".to_string(),
        coerce_value(id_type, &Value::String(id.to_string())).context("column 'id'")?,
    );

    for (column, value) in columns {
        if column == "id" || column == "created_at" || column == "updated_at" {
            continue;
        }
        match schema.get(column) {
            Some(ty) => {
                let coerced = coerce_value(*ty, value)
                    .with_context(|| format!("column '{}'", column))?;
                values.insert(column.to_string(), coerced);
            }
            None => tracing::debug!("Table {} has no column '{}'; dropping it", table, column),
        }
    }

    if schema.contains_key("created_at") {
        values.insert("created_at".to_string(), SqlValue::Timestamp(created_at));
    }
    if schema.contains_key("updated_at") {
        values.insert("updated_at".to_string(), SqlValue::Timestamp(updated_at));
    }

    Ok(PreparedRow {
        id: id.to_string(),
        values,
        created_at,
        updated_at,
    })
}

/// Coerce one JSON value to a column type. `null` is SQL `NULL` for every type.
pub fn coerce_value(ty: ColumnType, value: &Value) -> Result<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }

    let coerced = match ty {
        ColumnType::Json | ColumnType::Jsonb => SqlValue::Json(value.clone()),
        ColumnType::SmallInt => {
            let v = parse_integer(value)?;
            SqlValue::SmallInt(i16::try_from(v).map_err(|_| anyhow!("{} overflows smallint", v))?)
        }
        ColumnType::Integer => {
            let v = parse_integer(value)?;
            SqlValue::Integer(i32::try_from(v).map_err(|_| anyhow!("{} overflows integer", v))?)
        }
        ColumnType::BigInt => SqlValue::BigInt(parse_integer(value)?),
        ColumnType::Numeric => SqlValue::Numeric(parse_numeric(value)?),
        ColumnType::Boolean => SqlValue::Boolean(parse_bool(value)?),
        ColumnType::Real => SqlValue::Real(parse_float(value)? as f32),
        ColumnType::Double => SqlValue::Double(parse_float(value)?),
        ColumnType::Text | ColumnType::Other => SqlValue::Text(render_text(value)),
        ColumnType::Bytea => SqlValue::Bytes(parse_hex(value)?),
        ColumnType::Timestamp | ColumnType::TimestampTz => SqlValue::Timestamp(parse_timestamp(value)?),
        ColumnType::TextArray => SqlValue::TextArray(elements(value, |v| Ok(render_text(v)))?),
        ColumnType::SmallIntArray => SqlValue::SmallIntArray(elements(value, |v| {
            let n = parse_integer(v)?;
            i16::try_from(n).map_err(|_| anyhow!("{} overflows smallint", n))
        })?),
        ColumnType::IntegerArray => SqlValue::IntegerArray(elements(value, |v| {
            let n = parse_integer(v)?;
            i32::try_from(n).map_err(|_| anyhow!("{} overflows integer", n))
        })?),
        ColumnType::BigIntArray => SqlValue::BigIntArray(elements(value, parse_integer)?),
        ColumnType::NumericArray => SqlValue::NumericArray(elements(value, parse_numeric)?),
    };

    Ok(coerced)
}

/// Apply `f` to every element of an array; a bare scalar becomes a one-element array.
fn elements<T, F>(value: &Value, f: F) -> Result<Vec<T>>
where
    F: Fn(&Value) -> Result<T>,
{
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                if item.is_null() {
                    bail!("array element {} is null", i);
                }
                f(item).with_context(|| format!("array element {}", i))
            })
            .collect(),
        Value::Object(_) => bail!("expected an array, got an object"),
        scalar => Ok(vec![f(scalar)?]),
    }
}

fn parse_integer(value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Ok(v)
            } else if n.is_u64() {
                bail!("{} overflows bigint", n)
            } else {
                bail!("{} is not an integer", n)
            }
        }
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed.parse::<i64>().map_err(|_| {
                if is_numeric_literal(trimmed) && !trimmed.contains(['.', 'e', 'E']) {
                    anyhow!("'{}' overflows bigint", trimmed)
                } else {
                    anyhow!("'{}' is not an integer", trimmed)
                }
            })
        }
        other => bail!("expected an integer, got {}", kind(other)),
    }
}

fn parse_numeric(value: &Value) -> Result<String> {
    match value {
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) if is_numeric_literal(s.trim()) => Ok(s.trim().to_string()),
        Value::String(s) => bail!("'{}' is not a decimal number", s),
        other => bail!("expected a number, got {}", kind(other)),
    }
}

fn parse_float(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| anyhow!("{} is not a float", n)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| anyhow!("'{}' is not a float", s)),
        other => bail!("expected a float, got {}", kind(other)),
    }
}

fn parse_bool(value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" => Ok(true),
            "false" | "f" => Ok(false),
            _ => bail!("'{}' is not a boolean", s),
        },
        other => bail!("expected a boolean, got {}", kind(other)),
    }
}

fn parse_hex(value: &Value) -> Result<Vec<u8>> {
    let s = value
        .as_str()
        .ok_or_else(|| anyhow!("expected a 0x-prefixed hex string, got {}", kind(value)))?;
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| anyhow!("'{}' is not 0x-prefixed hex", s))?;
    hex::decode(digits).with_context(|| format!("'{}' is not valid hex", s))
}

/// Unix seconds (number or numeric string, as GraphQL `BigInt` timestamps arrive)
/// or an RFC 3339 / ISO 8601 string.
fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    let from_seconds = |secs: i64| {
        Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| anyhow!("{} is out of range for a timestamp", secs))
    };

    match value {
        Value::Number(_) => from_seconds(parse_integer(value)?),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(secs) = s.parse::<i64>() {
                return from_seconds(secs);
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                .map(|naive| naive.and_utc())
                .map_err(|_| anyhow!("'{}' is not a timestamp", s))
        }
        other => bail!("expected a timestamp, got {}", kind(other)),
    }
}

/// Strings verbatim; anything else as its JSON text.
fn render_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_numeric_literal(s: &str) -> bool {
    let s = s.strip_prefix(['-', '+']).unwrap_or(s);
    let (mantissa, exponent) = match s.find(['e', 'E']) {
        Some(pos) => (&s[..pos], Some(&s[pos + 1..])),
        None => (s, None),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (mantissa, None),
    };

    let digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());
    let mantissa_ok = digits(int_part)
        && frac_part.map_or(true, digits)
        && !(int_part.is_empty() && frac_part.map_or(true, str::is_empty));
    let exponent_ok = exponent.map_or(true, |e| {
        let e = e.strip_prefix(['-', '+']).unwrap_or(e);
        !e.is_empty() && digits(e)
    });

    mantissa_ok && exponent_ok
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integers_accept_numbers_and_numeric_strings() {
        assert_eq!(coerce_value(ColumnType::BigInt, &json!(42)).unwrap(), SqlValue::BigInt(42));
        assert_eq!(
            coerce_value(ColumnType::BigInt, &json!("19000000")).unwrap(),
            SqlValue::BigInt(19_000_000)
        );
        assert_eq!(coerce_value(ColumnType::Integer, &json!("7")).unwrap(), SqlValue::Integer(7));
        assert_eq!(coerce_value(ColumnType::SmallInt, &json!(-3)).unwrap(), SqlValue::SmallInt(-3));
    }

    #[test]
    fn test_integer_overflow_and_fraction_are_errors() {
        let err = coerce_value(ColumnType::Integer, &json!(3_000_000_000i64)).unwrap_err();
        assert!(err.to_string().contains("overflows integer"));

        let err = coerce_value(ColumnType::BigInt, &json!("123456789012345678901234567890")).unwrap_err();
        assert!(err.to_string().contains("overflows bigint"));

        assert!(coerce_value(ColumnType::BigInt, &json!(1.5)).is_err());
        assert!(coerce_value(ColumnType::BigInt, &json!("1.5")).is_err());
        assert!(coerce_value(ColumnType::BigInt, &json!("abc")).is_err());
        assert!(coerce_value(ColumnType::BigInt, &json!({"a": 1})).is_err());
    }

    #[test]
    fn test_numeric_keeps_exact_digits() {
        assert_eq!(
            coerce_value(ColumnType::Numeric, &json!("115792089237316195423570985008687907853269984665640564039457584007913129639935")).unwrap(),
            SqlValue::Numeric(
                "115792089237316195423570985008687907853269984665640564039457584007913129639935".to_string()
            )
        );
        assert_eq!(
            coerce_value(ColumnType::Numeric, &json!(12)).unwrap(),
            SqlValue::Numeric("12".to_string())
        );
        assert!(coerce_value(ColumnType::Numeric, &json!("-1.5e10")).is_ok());
        assert!(coerce_value(ColumnType::Numeric, &json!("12abc")).is_err());
        assert!(coerce_value(ColumnType::Numeric, &json!(".")).is_err());
    }

    #[test]
    fn test_arrays_wrap_scalars() {
        assert_eq!(
            coerce_value(ColumnType::TextArray, &json!(["0xa", "0xb"])).unwrap(),
            SqlValue::TextArray(vec!["0xa".to_string(), "0xb".to_string()])
        );
        assert_eq!(
            coerce_value(ColumnType::TextArray, &json!("0xa")).unwrap(),
            SqlValue::TextArray(vec!["0xa".to_string()])
        );
        assert_eq!(
            coerce_value(ColumnType::BigIntArray, &json!(["1", 2])).unwrap(),
            SqlValue::BigIntArray(vec![1, 2])
        );
        assert_eq!(
            coerce_value(ColumnType::NumericArray, &json!(["1000000000000000000000"])).unwrap(),
            SqlValue::NumericArray(vec!["1000000000000000000000".to_string()])
        );
        assert!(coerce_value(ColumnType::IntegerArray, &json!([1, null])).is_err());
    }

    #[test]
    fn test_bytea_requires_prefixed_hex() {
        assert_eq!(
            coerce_value(ColumnType::Bytea, &json!("0x00ff")).unwrap(),
            SqlValue::Bytes(vec![0x00, 0xff])
        );
        assert!(coerce_value(ColumnType::Bytea, &json!("00ff")).is_err());
        assert!(coerce_value(ColumnType::Bytea, &json!("0xabc")).is_err());
    }

    #[test]
    fn test_null_is_sql_null_for_every_type() {
        for ty in [ColumnType::BigInt, ColumnType::Jsonb, ColumnType::Bytea, ColumnType::TextArray] {
            assert_eq!(coerce_value(ty, &Value::Null).unwrap(), SqlValue::Null);
        }
    }

    #[test]
    fn test_text_and_json() {
        assert_eq!(
            coerce_value(ColumnType::Text, &json!("0xABC")).unwrap(),
            SqlValue::Text("0xABC".to_string())
        );
        assert_eq!(coerce_value(ColumnType::Text, &json!(5)).unwrap(), SqlValue::Text("5".to_string()));
        assert_eq!(
            coerce_value(ColumnType::Jsonb, &json!({"id": "0xA"})).unwrap(),
            SqlValue::Json(json!({"id": "0xA"}))
        );
    }

    #[test]
    fn test_timestamps_from_seconds_and_rfc3339() {
        let expected = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(
            coerce_value(ColumnType::TimestampTz, &json!("1700000000")).unwrap(),
            SqlValue::Timestamp(expected)
        );
        assert_eq!(
            coerce_value(ColumnType::Timestamp, &json!(1_700_000_000)).unwrap(),
            SqlValue::Timestamp(expected)
        );
        assert_eq!(
            coerce_value(ColumnType::TimestampTz, &json!("2023-11-14T22:13:20Z")).unwrap(),
            SqlValue::Timestamp(expected)
        );
    }

    #[test]
    fn test_prepare_row_drops_unknown_columns_and_stamps_times() {
        let schema: TableSchema = indexmap::IndexMap::from([
            ("id".to_string(), ColumnType::Text),
            ("block_number".to_string(), ColumnType::BigInt),
            ("raw_data".to_string(), ColumnType::Jsonb),
            ("created_at".to_string(), ColumnType::TimestampTz),
            ("updated_at".to_string(), ColumnType::TimestampTz),
        ]);
        let now = Utc::now();
        let block = json!("100");
        let extra = json!("x");
        let raw = json!({"id": "tx-0"});
        let row = prepare_row(
            "events",
            &schema,
            "tx-0",
            vec![("block_number", &block), ("not_a_column", &extra), ("raw_data", &raw)],
            now,
            now,
        )
        .unwrap();

        let names: Vec<&str> = row.values.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["id", "block_number", "raw_data", "created_at", "updated_at"]);
        assert_eq!(row.values["block_number"], SqlValue::BigInt(100));
        assert_eq!(row.values["created_at"], SqlValue::Timestamp(now));
    }

    #[test]
    fn test_prepare_row_reports_failing_column() {
        let schema: TableSchema = indexmap::IndexMap::from([
            ("id".to_string(), ColumnType::Text),
            ("block_number".to_string(), ColumnType::BigInt),
        ]);
        let now = Utc::now();
        let block = json!("not-a-number");
        let err = prepare_row("events", &schema, "tx-0", vec![("block_number", &block)], now, now)
            .unwrap_err();
        assert!(format!("{:#}", err).contains("column 'block_number'"));

        let err = prepare_row("events", &TableSchema::new(), "tx-0", Vec::new(), now, now).unwrap_err();
        assert!(err.to_string().contains("no 'id' column"));
    }
}

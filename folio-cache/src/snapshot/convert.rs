//! Property value conversion.
//!
//! A data type decides how a raw stored value becomes the value readers see.
//! Converted values are computed once per snapshot build, which is why a
//! data-type change has to invalidate every node using it.

use folio_core::DataType;
use serde_json::Value;

pub const TEXT_BOX: &str = "Folio.TextBox";
pub const INTEGER: &str = "Folio.Integer";
pub const TRUE_FALSE: &str = "Folio.TrueFalse";
pub const TAGS: &str = "Folio.Tags";

/// Convert a raw stored value with the given data type.
pub fn convert_value(data_type: &DataType, raw: Option<&Value>) -> Value {
    match data_type.editor_alias.as_str() {
        TEXT_BOX => text_box(data_type, raw),
        INTEGER => integer(raw),
        TRUE_FALSE => true_false(raw),
        TAGS => tags(data_type, raw),
        _ => raw.cloned().unwrap_or(Value::Null),
    }
}

fn text_box(data_type: &DataType, raw: Option<&Value>) -> Value {
    let text = match raw {
        None | Some(Value::Null) => return Value::Null,
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    match data_type
        .configuration
        .get("maxChars")
        .and_then(Value::as_u64)
    {
        Some(max) => Value::String(text.chars().take(max as usize).collect()),
        None => Value::String(text),
    }
}

fn integer(raw: Option<&Value>) -> Value {
    match raw {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .map(Value::from)
            .unwrap_or(Value::Null),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn true_false(raw: Option<&Value>) -> Value {
    let flag = match raw {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().map(|i| i != 0).unwrap_or(false),
        Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true"),
        _ => false,
    };
    Value::Bool(flag)
}

fn tags(data_type: &DataType, raw: Option<&Value>) -> Value {
    let delimiter = data_type
        .configuration
        .get("delimiter")
        .and_then(Value::as_str)
        .filter(|d| !d.is_empty())
        .unwrap_or(",");
    let items: Vec<Value> = match raw {
        Some(Value::String(s)) => s
            .split(delimiter)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| Value::String(t.to_string()))
            .collect(),
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| Value::String(t.to_string()))
            .collect(),
        _ => Vec::new(),
    };
    Value::Array(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::DataTypeId;
    use serde_json::json;

    fn data_type(editor: &str, configuration: Value) -> DataType {
        DataType::new(DataTypeId(1), "test", editor).with_configuration(configuration)
    }

    #[test]
    fn test_text_box_truncates_to_max_chars() {
        let dt = data_type(TEXT_BOX, json!({"maxChars": 5}));
        assert_eq!(convert_value(&dt, Some(&json!("Hello world"))), json!("Hello"));
        assert_eq!(convert_value(&dt, None), Value::Null);

        let unlimited = data_type(TEXT_BOX, Value::Null);
        assert_eq!(
            convert_value(&unlimited, Some(&json!("Hello world"))),
            json!("Hello world")
        );
        assert_eq!(convert_value(&unlimited, Some(&json!(12))), json!("12"));
    }

    #[test]
    fn test_integer_parsing() {
        let dt = data_type(INTEGER, Value::Null);
        assert_eq!(convert_value(&dt, Some(&json!("42"))), json!(42));
        assert_eq!(convert_value(&dt, Some(&json!(7.9))), json!(7));
        assert_eq!(convert_value(&dt, Some(&json!("seven"))), Value::Null);
    }

    #[test]
    fn test_true_false() {
        let dt = data_type(TRUE_FALSE, Value::Null);
        assert_eq!(convert_value(&dt, Some(&json!("1"))), json!(true));
        assert_eq!(convert_value(&dt, Some(&json!(0))), json!(false));
        assert_eq!(convert_value(&dt, None), json!(false));
    }

    #[test]
    fn test_tags_respect_delimiter() {
        let dt = data_type(TAGS, json!({"delimiter": ";"}));
        assert_eq!(
            convert_value(&dt, Some(&json!("rust; cache;;news"))),
            json!(["rust", "cache", "news"])
        );
        let default = data_type(TAGS, Value::Null);
        assert_eq!(
            convert_value(&default, Some(&json!(["a", " b ", ""]))),
            json!(["a", "b"])
        );
    }

    #[test]
    fn test_unknown_editor_passes_through() {
        let dt = data_type("Vendor.Map", Value::Null);
        assert_eq!(
            convert_value(&dt, Some(&json!({"lat": 1}))),
            json!({"lat": 1})
        );
    }
}

//! Parser for the terminal shortcut syntax.
//!
//! A client connecting through a raw terminal (netcat, PuTTY) cannot be
//! expected to type JSON. The manager therefore accepts a line-oriented
//! shortcut form and translates it into the JSON request shape:
//!
//! - `client` / `client <name>` — identify as a client
//! - `service <name>` — identify as a service
//! - `identity` — ask the manager for its identity
//! - `link <service>` — link with a service
//! - `<service> <attribute> [args] [key=value ...]` — send a request
//! - `disconnect` / `exit` — close the session

use crate::constants::{DISCONNECT_ATTRIBUTE, MANAGER_SERVICE, SELF_SERVICE};
use crate::message;
use serde_json::{json, Map, Value};

/// Parse one line of terminal input into its JSON equivalent.
///
/// Returns `None` when the line cannot be interpreted (for example a bare
/// service name with no attribute).
pub fn parse_terminal_input(line: &str) -> Option<Value> {
    let line = line.trim();
    let lower = line.to_ascii_lowercase();

    if lower == "identity" {
        return Some(message::request(
            MANAGER_SERVICE,
            "identity",
            &[],
            &Map::new(),
            "",
        ));
    }

    if lower == "client" || lower.starts_with("client ") {
        let name = line[6..].trim().replace('"', "");
        let name = if name.is_empty() { "Client".to_string() } else { name };
        return Some(json!({
            "type": "client",
            "name": name,
            "language": "unknown",
            "os": "unknown",
            "error": false,
        }));
    }

    if let Some(rest) = lower.strip_prefix("service ") {
        if !rest.trim().is_empty() {
            let name = line[8..].trim().replace('"', "");
            return Some(json!({
                "type": "service",
                "name": name,
                "language": "unknown",
                "os": "unknown",
                "attributes": {},
                "error": false,
            }));
        }
    }

    if lower == DISCONNECT_ATTRIBUTE || lower == "disconnect" || lower == "exit" {
        return Some(message::request(
            SELF_SERVICE,
            DISCONNECT_ATTRIBUTE,
            &[],
            &Map::new(),
            "",
        ));
    }

    if lower.starts_with("link ") {
        let name = line[5..].trim().replace('"', "");
        return Some(message::request(
            MANAGER_SERVICE,
            "link",
            &[Value::String(name)],
            &Map::new(),
            "",
        ));
    }

    // <service> <attribute> [args] [key=value ...]
    let tokens = tokenize(line);
    if tokens.len() < 2 {
        return None;
    }
    let service = tokens[0].trim_matches('"').to_string();
    let attribute = tokens[1].trim_matches('"').to_string();

    let mut args = Vec::new();
    let mut kwargs = Map::new();
    for token in &tokens[2..] {
        match split_kwarg(token) {
            Some((key, value)) => {
                kwargs.insert(key.to_string(), convert_value(value));
            }
            None => {
                if kwargs.is_empty() {
                    args.push(convert_value(token));
                }
            }
        }
    }

    Some(message::request(&service, &attribute, &args, &kwargs, ""))
}

/// Split a line into whitespace-separated tokens, keeping double-quoted
/// spans together.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in line.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Split `key=value` when `key` is a bare identifier; `None` otherwise.
fn split_kwarg(token: &str) -> Option<(&str, &str)> {
    let (key, value) = token.split_once('=')?;
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((key, value))
}

/// Interpret a bare token as the closest JSON value.
fn convert_value(token: &str) -> Value {
    if token.starts_with('"') && token.ends_with('"') && token.len() >= 2 {
        return Value::String(token[1..token.len() - 1].to_string());
    }
    match token.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "none" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = token.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = token.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_line() {
        let value = parse_terminal_input(" identity ").unwrap();
        assert_eq!(value["service"], "Manager");
        assert_eq!(value["attribute"], "identity");
        assert_eq!(value["uid"], "");
    }

    #[test]
    fn client_with_default_name() {
        let value = parse_terminal_input("client").unwrap();
        assert_eq!(value["type"], "client");
        assert_eq!(value["name"], "Client");
    }

    #[test]
    fn client_with_spaced_name() {
        let value = parse_terminal_input("client Me and Myself").unwrap();
        assert_eq!(value["name"], "Me and Myself");
    }

    #[test]
    fn service_short_form() {
        let value = parse_terminal_input("service Heartbeat").unwrap();
        assert_eq!(value["type"], "service");
        assert_eq!(value["name"], "Heartbeat");
    }

    #[test]
    fn disconnect_aliases() {
        for line in ["disconnect", "exit", "__disconnect__"] {
            let value = parse_terminal_input(line).unwrap();
            assert_eq!(value["service"], "self");
            assert_eq!(value["attribute"], "__disconnect__");
        }
    }

    #[test]
    fn link_line() {
        let value = parse_terminal_input("link \"String Editor\"").unwrap();
        assert_eq!(value["service"], "Manager");
        assert_eq!(value["attribute"], "link");
        assert_eq!(value["args"], serde_json::json!(["String Editor"]));
    }

    #[test]
    fn request_with_args_and_kwargs() {
        let value = parse_terminal_input("BasicMath add 4 7.5 x=1 flag=true").unwrap();
        assert_eq!(value["service"], "BasicMath");
        assert_eq!(value["attribute"], "add");
        assert_eq!(value["args"], serde_json::json!([4, 7.5]));
        assert_eq!(value["kwargs"], serde_json::json!({"x": 1, "flag": true}));
    }

    #[test]
    fn quoted_argument_keeps_spaces() {
        let value = parse_terminal_input("Echo echo \"hello world\" null").unwrap();
        assert_eq!(value["args"], serde_json::json!(["hello world", null]));
    }

    #[test]
    fn attribute_missing_is_unparseable() {
        assert!(parse_terminal_input("Echo").is_none());
        assert!(parse_terminal_input("").is_none());
    }
}

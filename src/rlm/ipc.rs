//! JSON-RPC 2.0 over line-delimited JSON, used for the REPL sandbox's IPC
//! with its container-mode child process.

use serde_json::{Value, json};
use uuid::Uuid;

/// A unique-per-call id.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn encode_request(id: &str, method: &str, params: Value) -> String {
    serde_json::to_string(&json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    }))
    .expect("JSON-RPC requests are always serializable")
}

pub fn encode_notification(method: &str, params: Value) -> String {
    serde_json::to_string(&json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    }))
    .expect("JSON-RPC notifications are always serializable")
}

pub fn encode_response(id: &Value, result: Value) -> String {
    serde_json::to_string(&json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    }))
    .expect("JSON-RPC responses are always serializable")
}

pub fn encode_error(id: &Value, code: i64, message: &str) -> String {
    serde_json::to_string(&json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    }))
    .expect("JSON-RPC errors are always serializable")
}

pub fn decode(line: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(line)
}

/// Is this message a call (request/notification) rather than a response?
pub fn is_call(message: &Value) -> bool {
    message.get("method").is_some()
}

pub fn has_id(message: &Value) -> bool {
    message.get("id").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let id = generate_id();
        let encoded = encode_request(&id, "execute", json!({ "code": "FINAL(1)" }));
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded["id"], json!(id));
        assert_eq!(decoded["method"], "execute");
        assert_eq!(decoded["params"]["code"], "FINAL(1)");
    }

    #[test]
    fn response_round_trips() {
        let id = json!("abc");
        let encoded = encode_response(&id, json!({ "output": "hi" }));
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded["id"], id);
        assert_eq!(decoded["result"]["output"], "hi");
        assert!(!is_call(&decoded));
    }

    #[test]
    fn notification_has_no_id() {
        let encoded = encode_notification("output_chunk", json!({ "text": "..." }));
        let decoded = decode(&encoded).unwrap();
        assert!(is_call(&decoded));
        assert!(!has_id(&decoded));
    }

    #[test]
    fn error_round_trips() {
        let id = json!(5);
        let encoded = encode_error(&id, -32601, "method not found");
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded["error"]["code"], -32601);
    }
}

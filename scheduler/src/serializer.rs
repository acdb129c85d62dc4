use trawler_core::error::Result;
use trawler_core::request::Request;

/// Converts requests to bytes on queue push and back on pop.
///
/// Serializers must be byte-stable: serializing a deserialized request
/// yields exactly the original bytes. Request fields use ordered maps so
/// this holds for any field content.
pub trait RequestSerializer: Send + Sync + 'static {
    fn serialize(&self, request: &Request) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Request>;
}

/// JSON serializer, the default. Payloads are human-readable in the queue
/// backend, which makes shared Redis/AMQP queues debuggable from the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl RequestSerializer for JsonSerializer {
    fn serialize(&self, request: &Request) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Request> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Look up a serializer implementation by its registered name.
pub fn serializer_by_name(name: &str) -> Option<Box<dyn RequestSerializer>> {
    match name {
        "json" => Some(Box::new(JsonSerializer)),
        _ => None,
    }
}

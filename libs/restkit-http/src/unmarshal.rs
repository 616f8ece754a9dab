/// Decodes downloaded response bodies for [`Response::json`](crate::Response::json).
///
/// Set one on the [`PipelineBuilder`](crate::PipelineBuilder) or per call on the
/// [`Context`](crate::Context) to handle payloads plain JSON decoding rejects.
pub trait Unmarshaler: Send + Sync {
    /// # Errors
    /// Returns the decoding failure.
    fn unmarshal(&self, body: &[u8]) -> Result<serde_json::Value, serde_json::Error>;
}

/// Plain `serde_json` decoding
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonUnmarshaler;

impl Unmarshaler for JsonUnmarshaler {
    fn unmarshal(&self, body: &[u8]) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// JSON decoding that tolerates a leading UTF-8 byte order mark
#[derive(Debug, Clone, Copy, Default)]
pub struct BomTolerantUnmarshaler;

impl Unmarshaler for BomTolerantUnmarshaler {
    fn unmarshal(&self, body: &[u8]) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body))
    }
}

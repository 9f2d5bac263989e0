//! PayloadCodec - payload (JSON) と JobKind の相互変換

use super::job::JobKind;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode '{kind}' payload: {message}")]
    Encode { kind: &'static str, message: String },

    #[error("failed to decode '{kind}' payload: {message}")]
    Decode { kind: &'static str, message: String },
}

/// PayloadCodec は JobKind を `serde_json::Value` に変換
///
/// - encode: gateway が enqueue 前に使う
/// - decode: worker が handler 呼び出し前に使う。失敗は再試行しても
///   直らないので fatal 扱い（呼び出し側で `JobError::decode` に変換）
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadCodec;

impl PayloadCodec {
    pub fn encode<T: JobKind>(job: &T) -> Result<serde_json::Value, CodecError> {
        serde_json::to_value(job).map_err(|e| CodecError::Encode {
            kind: T::KIND,
            message: e.to_string(),
        })
    }

    pub fn decode<T: JobKind>(payload: serde_json::Value) -> Result<T, CodecError> {
        serde_json::from_value(payload).map_err(|e| CodecError::Decode {
            kind: T::KIND,
            message: e.to_string(),
        })
    }
}

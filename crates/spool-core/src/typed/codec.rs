//! PayloadCodec - `dataJson` と Task の相互変換

use super::task::Task;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode {task_type}: {source}")]
    Encode {
        task_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {task_type} payload: {source}")]
    Decode {
        task_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// PayloadCodec は Task を `dataJson` 文字列に変換する
///
/// キューは payload を解釈しない。変換はここと Handler 側だけで行う。
pub struct PayloadCodec;

impl PayloadCodec {
    pub fn encode<T: Task>(task: &T) -> Result<String, CodecError> {
        serde_json::to_string(task).map_err(|source| CodecError::Encode {
            task_type: T::TYPE,
            source,
        })
    }

    pub fn decode<T: Task>(data_json: &str) -> Result<T, CodecError> {
        serde_json::from_str(data_json).map_err(|source| CodecError::Decode {
            task_type: T::TYPE,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::task::fixtures::TestTask;

    #[test]
    fn decode_reads_what_encode_wrote() {
        let json = PayloadCodec::encode(&TestTask { value: 7 }).unwrap();
        assert_eq!(json, r#"{"value":7}"#);
        assert_eq!(
            PayloadCodec::decode::<TestTask>(&json).unwrap(),
            TestTask { value: 7 }
        );
    }

    #[test]
    fn decode_error_names_the_task_type() {
        let err = PayloadCodec::decode::<TestTask>(r#"{"value":"x"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
        assert!(err.to_string().contains(TestTask::TYPE));
    }
}

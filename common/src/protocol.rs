// 网关控制/数据协议
//
// 文本帧为紧凑 JSON 数组 `[tag, payload]`，tag 为单字符；
// 二进制帧承载编码后的视频数据：
//
// ```text
// [1 字节: 键长度 N][N 字节: UTF-8 数据源键][剩余: 编码数据]
// ```

use crate::error::{GatewayError, Result};
use crate::types::{Quality, SourceInfo, SourceKey, StreamMeta, MAX_SOURCE_KEY_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// 消息类型标签
pub mod tags {
    pub const PING: &str = "p";
    pub const PONG: &str = "q";
    pub const SOURCE_LIST: &str = "t";
    pub const DATA: &str = "m";
    pub const STREAM_META: &str = "v";
    pub const SYSTEM: &str = "y";
    pub const SUBSCRIBE: &str = "s";
    pub const UNSUBSCRIBE: &str = "u";
    pub const STREAM_SETTINGS: &str = "f";
}

/// 订阅时未指定速率的默认值（Hz）
pub const DEFAULT_MAX_UPDATE_RATE: f64 = 24.0;

/// 客户端 → 服务器消息
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Pong {
        token: u64,
    },
    Subscribe {
        source: SourceKey,
        max_update_rate: f64,
    },
    Unsubscribe {
        source: SourceKey,
    },
    /// fps 为 0 表示自动（跟随检测到的源帧率）
    StreamSettings {
        source: SourceKey,
        fps: u32,
        quality: Quality,
    },
}

#[derive(Deserialize)]
struct PongPayload {
    s: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribePayload {
    source_key: String,
    max_update_rate: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnsubscribePayload {
    source_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamSettingsPayload {
    source_key: String,
    fps: Option<f64>,
    quality: Option<String>,
}

impl ClientMessage {
    /// 解析客户端文本帧
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let (tag, payload) = match value {
            Value::Array(mut items) if items.len() == 2 => {
                let payload = items.pop().unwrap_or(Value::Null);
                match (items.pop(), payload) {
                    (Some(Value::String(tag)), payload @ Value::Object(_)) => (tag, payload),
                    _ => {
                        return Err(GatewayError::MalformedMessage(
                            "expected [string, object]".to_string(),
                        ))
                    }
                }
            }
            _ => {
                return Err(GatewayError::MalformedMessage(
                    "expected a two-element array".to_string(),
                ))
            }
        };

        match tag.as_str() {
            tags::PONG => {
                let pong: PongPayload = serde_json::from_value(payload)?;
                Ok(Self::Pong { token: pong.s })
            }
            tags::SUBSCRIBE => {
                let sub: SubscribePayload = serde_json::from_value(payload)?;
                let max_update_rate = sub.max_update_rate.unwrap_or(DEFAULT_MAX_UPDATE_RATE);
                if !max_update_rate.is_finite() || max_update_rate <= 0.0 {
                    return Err(GatewayError::InvalidParameter(format!(
                        "maxUpdateRate must be positive, got {}",
                        max_update_rate
                    )));
                }
                Ok(Self::Subscribe {
                    source: SourceKey::new(sub.source_key),
                    max_update_rate,
                })
            }
            tags::UNSUBSCRIBE => {
                let unsub: UnsubscribePayload = serde_json::from_value(payload)?;
                Ok(Self::Unsubscribe {
                    source: SourceKey::new(unsub.source_key),
                })
            }
            tags::STREAM_SETTINGS => {
                let settings: StreamSettingsPayload = serde_json::from_value(payload)?;
                let fps = settings
                    .fps
                    .filter(|fps| fps.is_finite() && *fps > 0.0)
                    .map(|fps| fps.round() as u32)
                    .unwrap_or(0);
                Ok(Self::StreamSettings {
                    source: SourceKey::new(settings.source_key),
                    fps,
                    quality: Quality::parse_lossy(settings.quality.as_deref()),
                })
            }
            other => Err(GatewayError::UnknownTag(other.to_string())),
        }
    }
}

/// 服务器 → 客户端文本消息
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Ping { token: u64, latency_ms: f64 },
    SourceList(BTreeMap<SourceKey, SourceInfo>),
    Data(Value),
    StreamMeta(StreamMeta),
    System { hostname: String, version: String },
}

impl ServerMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Ping { .. } => tags::PING,
            Self::SourceList(_) => tags::SOURCE_LIST,
            Self::Data(_) => tags::DATA,
            Self::StreamMeta(_) => tags::STREAM_META,
            Self::System { .. } => tags::SYSTEM,
        }
    }

    /// 序列化为文本帧
    pub fn to_text(&self) -> Result<String> {
        let payload = match self {
            Self::Ping { token, latency_ms } => json!({
                "s": token,
                "l": (latency_ms * 10.0).round() / 10.0,
            }),
            Self::SourceList(sources) => serde_json::to_value(sources)?,
            Self::Data(value) => value.clone(),
            Self::StreamMeta(meta) => serde_json::to_value(meta)?,
            Self::System { hostname, version } => json!({
                "hostname": hostname,
                "version": version,
            }),
        };
        Ok(serde_json::to_string(&(self.tag(), payload))?)
    }
}

/// 构造二进制帧头（每个数据源只需构造一次）
pub fn binary_frame_header(source: &SourceKey) -> Result<Bytes> {
    let key = source.as_str().as_bytes();
    if key.is_empty() || key.len() > MAX_SOURCE_KEY_LEN {
        return Err(GatewayError::InvalidBinaryFrame(format!(
            "source key length {} out of range 1..={}",
            key.len(),
            MAX_SOURCE_KEY_LEN
        )));
    }
    let mut header = BytesMut::with_capacity(1 + key.len());
    header.put_u8(key.len() as u8);
    header.put_slice(key);
    Ok(header.freeze())
}

/// 拼接帧头与编码数据
pub fn encode_binary_frame(header: &[u8], payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(header.len() + payload.len());
    frame.put_slice(header);
    frame.put_slice(payload);
    frame.freeze()
}

/// 解析二进制帧，返回 (数据源键, 编码数据)
pub fn decode_binary_frame(frame: &[u8]) -> Result<(&str, &[u8])> {
    let (&len, rest) = frame
        .split_first()
        .ok_or_else(|| GatewayError::InvalidBinaryFrame("empty frame".to_string()))?;
    let len = len as usize;
    if len == 0 || rest.len() < len {
        return Err(GatewayError::InvalidBinaryFrame(format!(
            "key length {} exceeds frame size {}",
            len,
            rest.len()
        )));
    }
    let key = std::str::from_utf8(&rest[..len])
        .map_err(|e| GatewayError::InvalidBinaryFrame(e.to_string()))?;
    Ok((key, &rest[len..]))
}

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use crate::domain::ErrorFrame;

/// 序列化并写入会话发送队列 / Serialize and queue on the session writer
pub fn send_json<T: Serialize>(tx: &mpsc::UnboundedSender<Message>, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(text) => tx.send(Message::Text(text)).is_ok(),
        Err(e) => {
            warn!("⚠️ failed to encode outbound frame: {}", e);
            false
        }
    }
}

pub fn send_error(tx: &mpsc::UnboundedSender<Message>, message: impl Into<String>) -> bool {
    send_json(tx, &ErrorFrame::new(message))
}

pub fn close_message(code: CloseCode, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: std::borrow::Cow::Owned(reason.to_string()),
    }))
}

/// 错误帧后紧跟关闭帧 / Error frame followed by a close frame
pub fn reject(tx: &mpsc::UnboundedSender<Message>, code: CloseCode, reason: &str) {
    send_error(tx, reason);
    let _ = tx.send(close_message(code, reason));
}

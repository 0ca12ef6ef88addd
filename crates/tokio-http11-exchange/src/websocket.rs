//! アップグレード後の WebSocket セッション
//!
//! フレーム処理は tokio-tungstenite に任せる。
//! ハンドシェイクのレスポンスと一緒に読んでしまったバイト列はストリームの先頭として渡す。

use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;

use crate::error::{Error, Result};
use crate::io::Io;

/// WebSocket セッション
pub struct WebSocketSession {
    stream: WebSocketStream<Io>,
    protocol: Option<String>,
}

impl WebSocketSession {
    pub(crate) async fn from_upgraded(io: Io, leftover: Bytes, protocol: Option<String>) -> Self {
        let stream =
            WebSocketStream::from_partially_read(io, leftover.to_vec(), Role::Client, None).await;
        Self { stream, protocol }
    }

    /// ハンドシェイクで選ばれたサブプロトコル
    pub fn selected_protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.stream.send(message).await?;
        Ok(())
    }

    /// 次のメッセージ。閉じられたら `None`
    pub async fn receive(&mut self) -> Option<Result<Message>> {
        self.stream.next().await.map(|r| r.map_err(Error::from))
    }

    /// Close フレームを送って閉じる
    pub async fn close(mut self) -> Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }

    /// 受信側と送信側に分ける
    pub fn split(self) -> (WebSocketInbound, WebSocketOutbound) {
        let (sink, stream) = self.stream.split();
        (
            WebSocketInbound {
                stream,
                protocol: self.protocol,
            },
            WebSocketOutbound {
                sink: Arc::new(Mutex::new(sink)),
            },
        )
    }
}

/// 受信側
pub struct WebSocketInbound {
    stream: SplitStream<WebSocketStream<Io>>,
    protocol: Option<String>,
}

impl WebSocketInbound {
    pub fn selected_protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// 次のメッセージ。閉じられたら `None`
    pub async fn receive(&mut self) -> Option<Result<Message>> {
        self.stream.next().await.map(|r| r.map_err(Error::from))
    }
}

/// 送信側
///
/// 複製しても同じ接続に書き込む
#[derive(Clone)]
pub struct WebSocketOutbound {
    sink: Arc<Mutex<SplitSink<WebSocketStream<Io>, Message>>>,
}

impl WebSocketOutbound {
    pub async fn send(&self, message: Message) -> Result<()> {
        self.sink.lock().await.send(message).await?;
        Ok(())
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send(Message::text(text.to_string())).await
    }

    pub async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.send(Message::binary(data)).await
    }

    /// Close フレームを送って閉じる
    pub async fn close(&self) -> Result<()> {
        self.sink.lock().await.close().await?;
        Ok(())
    }
}

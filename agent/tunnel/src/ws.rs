//! A byte-stream view of a broker WebSocket.
//!
//! The multiplexer wants an ordered byte pipe; the broker speaks binary
//! WebSocket frames. Reads drain frames into a buffer, writes send one
//! binary frame per call, and a 30 s keep-alive ping rides along with the
//! read path.

use futures::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const KEEP_ALIVE: Duration = Duration::from_secs(30);

pub struct WsConn {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    read_buf: Vec<u8>,
    read_pos: usize,
    keep_alive: tokio::time::Interval,
}

impl WsConn {
    pub fn new(ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        let mut keep_alive = tokio::time::interval(KEEP_ALIVE);
        keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self {
            ws,
            read_buf: Vec::new(),
            read_pos: 0,
            keep_alive,
        }
    }

    fn poll_keep_alive(&mut self, cx: &mut Context<'_>) {
        if self.keep_alive.poll_tick(cx).is_pending() {
            return;
        }
        // Best effort: a ping that cannot be queued right now is simply
        // skipped until the next tick.
        if let Poll::Ready(Ok(())) = Pin::new(&mut self.ws).poll_ready(cx) {
            let _ = Pin::new(&mut self.ws).start_send(Message::Ping(Default::default()));
            let _ = Pin::new(&mut self.ws).poll_flush(cx);
        }
    }
}

impl futures::io::AsyncRead for WsConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        loop {
            if this.read_pos < this.read_buf.len() {
                let n = buf.len().min(this.read_buf.len() - this.read_pos);
                buf[..n].copy_from_slice(&this.read_buf[this.read_pos..this.read_pos + n]);
                this.read_pos += n;
                return Poll::Ready(Ok(n));
            }

            this.poll_keep_alive(cx);

            match Pin::new(&mut this.ws).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    this.read_buf = data.as_ref().to_vec();
                    this.read_pos = 0;
                }
                Poll::Ready(Some(Ok(Message::Ping(_)))) => {
                    // tungstenite queues the pong; nudge it onto the wire.
                    let _ = Pin::new(&mut this.ws).poll_flush(cx);
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(0));
                }
                Poll::Ready(Some(Ok(_))) => {}
                Poll::Ready(Some(Err(error))) => {
                    return Poll::Ready(Err(io::Error::other(error)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl futures::io::AsyncWrite for WsConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.ws).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(error)) => return Poll::Ready(Err(io::Error::other(error))),
            Poll::Pending => return Poll::Pending,
        }
        match Pin::new(&mut this.ws).start_send(Message::binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(error) => Poll::Ready(Err(io::Error::other(error))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.ws)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.ws)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}

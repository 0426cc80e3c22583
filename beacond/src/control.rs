use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use shared::protocol::{encode_reply, Command, Reply, MAX_CONTROL_FRAME};
use crate::beacon::Request;

/// 4-byte big-endian length prefix, then the JSON body
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_CONTROL_FRAME)
        .new_codec()
}

/// Accept control connections until cancelled, forwarding each request to
/// the beacon loop. Returns once every open connection has written its last
/// reply.
pub async fn serve(listener: TcpListener, tx: mpsc::Sender<Request>, cancel: CancellationToken) {
    let connections = TaskTracker::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("Control connection from {}", peer);
                    connections.spawn(handle_connection(stream, tx.clone(), cancel.clone()));
                }
                Err(e) => tracing::warn!("Failed to accept control connection: {}", e),
            },
            _ = cancel.cancelled() => {
                tracing::debug!("Control server shutting down");
                break;
            }
        }
    }
    drop(tx);
    connections.close();
    connections.wait().await;
}

/// One request, one reply, repeated until the caller hangs up. A caller that
/// hangs up (or sends again) before its reply abandons the request.
async fn handle_connection(stream: TcpStream, tx: mpsc::Sender<Request>, cancel: CancellationToken) {
    let mut framed = Framed::new(stream, codec());

    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = cancel.cancelled() => break,
        };
        let bytes = match frame {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                tracing::debug!("Dropping control connection: {}", e);
                break;
            }
            None => break,
        };

        let reply = match Command::decode(&bytes) {
            Ok(command) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if tx.send(Request { command, reply: reply_tx }).await.is_err() {
                    break;
                }
                tokio::select! {
                    reply = reply_rx => reply.unwrap_or(None),
                    _ = framed.next() => {
                        tracing::debug!("Control caller left before its reply");
                        break;
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Rejecting control request: {}", e);
                None
            }
        };

        if let Err(e) = send_reply(&mut framed, reply.as_ref()).await {
            tracing::debug!("Failed to send control reply: {}", e);
            break;
        }
    }
}

async fn send_reply(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    reply: Option<&Reply>,
) -> anyhow::Result<()> {
    let encoded = encode_reply(reply)?;
    framed.send(Bytes::from(encoded)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use shared::protocol::{decode_reply, Wait};

    async fn exchange(
        framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
        body: &[u8],
    ) -> Option<Reply> {
        framed.send(Bytes::copy_from_slice(body)).await.unwrap();
        let frame = framed.next().await.unwrap().unwrap();
        decode_reply(&frame).unwrap()
    }

    /// Serve on an ephemeral port, answering every request with `answer`.
    async fn fake_beacon(answer: Option<Reply>) -> (std::net::SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel::<Request>(8);
        let cancel = CancellationToken::new();

        tokio::spawn(serve(listener, tx, cancel.clone()));
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let _ = request.reply.send(answer.clone());
            }
        });
        (addr, cancel)
    }

    #[tokio::test]
    async fn test_malformed_request_gets_null_and_connection_survives() {
        let answer = Some(Reply::Address("10.0.0.1:5000".to_string()));
        let (addr, cancel) = fake_beacon(answer.clone()).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, codec());

        assert_eq!(exchange(&mut framed, b"not json").await, None);
        assert_eq!(exchange(&mut framed, br#"["explode"]"#).await, None);

        let discover = Command::Discover {
            name: "echo".to_string(),
            wait: Wait::For(Duration::from_millis(500)),
        };
        assert_eq!(exchange(&mut framed, &discover.encode().unwrap()).await, answer);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_forwards_decoded_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel::<Request>(8);
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, tx, cancel.clone()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, codec());
        framed
            .send(Bytes::from(Command::Pause.encode().unwrap()))
            .await
            .unwrap();

        let request = rx.recv().await.unwrap();
        assert_eq!(request.command, Command::Pause);
        request.reply.send(None).unwrap();

        let frame = framed.next().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"null");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_hang_up_abandons_pending_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel::<Request>(8);
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, tx, cancel.clone()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, codec());
        let discover = Command::Discover {
            name: "never".to_string(),
            wait: Wait::Forever,
        };
        framed.send(Bytes::from(discover.encode().unwrap())).await.unwrap();

        let mut request = rx.recv().await.unwrap();
        assert!(!request.reply.is_closed());
        drop(framed);

        tokio::time::timeout(Duration::from_secs(2), request.reply.closed())
            .await
            .unwrap();

        cancel.cancel();
    }
}

//! Built-in TCP transport for node connections.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use axl_core::{ClusterDescription, ClusterMember, Endpoint};
use axl_network::{Command, FRAME_HEADER_SIZE, Frame, HelloPayload, encode_frame, parse_frame};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{ClientError, Result};
use crate::node::{NodeClient, NodeConnector, SessionOptions};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Connector that opens framed TCP connections
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl NodeConnector for TcpConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: &SessionOptions,
    ) -> Result<Box<dyn NodeClient>> {
        let client = TcpNodeClient::connect(endpoint, options).await?;
        Ok(Box::new(client))
    }
}

/// A single framed TCP connection to one node
pub struct TcpNodeClient {
    endpoint: Endpoint,
    stream: TcpStream,
    read_timeout: Duration,
    next_request_id: u64,
    read_buffer: Vec<u8>,
    read_offset: usize,
}

impl TcpNodeClient {
    /// Connect and complete the `Hello` handshake
    pub async fn connect(endpoint: &Endpoint, options: &SessionOptions) -> Result<Self> {
        debug!(target: "axl::transport", endpoint = %endpoint, "Connecting to node");

        let addr = (endpoint.host.as_str(), endpoint.port);
        let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::connect_failure(endpoint, ClientError::Timeout))?
            .map_err(|e| ClientError::connect_failure(endpoint, ClientError::Io(e)))?;

        stream.set_nodelay(true)?;

        let mut client = Self {
            endpoint: endpoint.clone(),
            stream,
            read_timeout: options.read_timeout,
            next_request_id: 0,
            read_buffer: vec![0u8; READ_BUFFER_SIZE],
            read_offset: 0,
        };

        client
            .handshake(options)
            .await
            .map_err(|e| ClientError::connect_failure(endpoint, e))?;

        debug!(target: "axl::transport", endpoint = %endpoint, "Connected to node");
        Ok(client)
    }

    async fn handshake(&mut self, options: &SessionOptions) -> Result<()> {
        let credentials = match &options.credentials {
            Some(provider) => Some(provider.credentials()?),
            None => None,
        };

        let hello = HelloPayload {
            region: options.region.clone(),
            user_agent: options.user_agent.clone(),
            access_key_id: credentials.as_ref().map(|c| c.access_key_id.clone()),
            session_token: credentials.and_then(|c| c.session_token),
        };

        let request_id = self.next_request_id();
        self.send_frame(&Frame::new_hello(request_id, &hello)?)
            .await?;
        self.expect(Command::HelloAck, request_id).await?;
        Ok(())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn next_request_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let bytes = encode_frame(frame);
        tokio::time::timeout(self.read_timeout, self.stream.write_all(&bytes))
            .await
            .map_err(|_| ClientError::Timeout)??;
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Frame> {
        loop {
            if self.read_offset >= FRAME_HEADER_SIZE {
                if let Some((frame, consumed)) = parse_frame(&self.read_buffer[..self.read_offset])?
                {
                    self.read_buffer.copy_within(consumed..self.read_offset, 0);
                    self.read_offset -= consumed;
                    return Ok(frame);
                }
            }

            // Grow for frames larger than the default buffer
            if self.read_offset == self.read_buffer.len() {
                let new_len = self.read_buffer.len() * 2;
                self.read_buffer.resize(new_len, 0);
            }

            let n = tokio::time::timeout(
                self.read_timeout,
                self.stream.read(&mut self.read_buffer[self.read_offset..]),
            )
            .await
            .map_err(|_| ClientError::Timeout)??;

            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }

            self.read_offset += n;
        }
    }

    /// Receive the reply to `request_id` and check its command
    async fn expect(&mut self, expected: Command, request_id: u64) -> Result<Frame> {
        let frame = self.recv_frame().await?;

        if frame.request_id() != request_id {
            return Err(ClientError::InvalidResponse(format!(
                "Expected reply to request {}, got {}",
                request_id,
                frame.request_id()
            )));
        }

        match frame.command() {
            cmd if cmd == expected => {
                trace!(target: "axl::transport", command = ?cmd, request_id, "Received reply");
                Ok(frame)
            },
            Command::ErrorResponse => Err(ClientError::Server(frame.error_message())),
            other => Err(ClientError::InvalidResponse(format!(
                "Expected {:?}, got {:?}",
                expected, other
            ))),
        }
    }
}

#[async_trait]
impl NodeClient for TcpNodeClient {
    async fn request(&mut self, payload: Bytes) -> Result<Bytes> {
        let request_id = self.next_request_id();
        self.send_frame(&Frame::new_request(request_id, payload))
            .await?;
        let frame = self.expect(Command::Response, request_id).await?;
        Ok(frame.payload.unwrap_or_default())
    }

    async fn ping(&mut self) -> Result<Duration> {
        let start = Instant::now();
        let request_id = self.next_request_id();
        self.send_frame(&Frame::new_ping(request_id)).await?;
        self.expect(Command::Pong, request_id).await?;
        Ok(start.elapsed())
    }

    async fn describe_cluster(&mut self) -> Result<Vec<ClusterMember>> {
        let request_id = self.next_request_id();
        self.send_frame(&Frame::new_describe_cluster(request_id))
            .await?;
        let frame = self
            .expect(Command::ClusterDescription, request_id)
            .await?;
        let description: ClusterDescription = frame.decode_json()?;
        Ok(description.members)
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for TcpNodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpNodeClient")
            .field("endpoint", &self.endpoint)
            .field("next_request_id", &self.next_request_id)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axl_core::{Credentials, NodeRole, StaticCredentialsProvider};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serve one connection, answering each frame like a node would.
    /// The received `Hello` payload is reported through `hello_tx`.
    async fn spawn_fake_node(
        members: Vec<ClusterMember>,
        hello_tx: oneshot::Sender<HelloPayload>,
    ) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut hello_tx = Some(hello_tx);
            let mut buf = Vec::new();
            let mut chunk = vec![0u8; 4096];

            loop {
                let n = match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);

                while let Some((frame, used)) = parse_frame(&buf).unwrap() {
                    buf.drain(..used);
                    let id = frame.request_id();
                    let reply = match frame.command() {
                        Command::Hello => {
                            if let Some(tx) = hello_tx.take() {
                                let _ = tx.send(frame.decode_json().unwrap());
                            }
                            Frame::new_hello_ack(id)
                        },
                        Command::Ping => Frame::new_pong(id),
                        Command::DescribeCluster => Frame::new_cluster_description(
                            id,
                            &ClusterDescription {
                                members: members.clone(),
                            },
                        )
                        .unwrap(),
                        Command::Request => match frame.payload.as_deref() {
                            Some(b"fail") => Frame::new_error(id, "ValidationException"),
                            body => {
                                let mut echo = b"echo:".to_vec();
                                echo.extend_from_slice(body.unwrap_or_default());
                                Frame::new_response(id, Bytes::from(echo))
                            },
                        },
                        _ => Frame::new_error(id, "unsupported"),
                    };
                    socket.write_all(&encode_frame(&reply)).await.unwrap();
                }
            }
        });

        Endpoint::new("127.0.0.1", port)
    }

    fn options() -> SessionOptions {
        SessionOptions {
            region: "us-west-2".to_string(),
            user_agent: "axl-test".to_string(),
            credentials: Some(Arc::new(StaticCredentialsProvider::new(
                Credentials::new("AKID", "secret").with_session_token("token"),
            ))),
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_handshake_sends_session_parameters() {
        let (tx, rx) = oneshot::channel();
        let endpoint = spawn_fake_node(Vec::new(), tx).await;

        let client = TcpNodeClient::connect(&endpoint, &options()).await.unwrap();
        let hello = rx.await.unwrap();

        assert_eq!(hello.region, "us-west-2");
        assert_eq!(hello.user_agent, "axl-test");
        assert_eq!(hello.access_key_id.as_deref(), Some("AKID"));
        assert_eq!(hello.session_token.as_deref(), Some("token"));
        assert_eq!(client.endpoint(), &endpoint);
    }

    #[tokio::test]
    async fn test_ping_describe_and_request() {
        let members = vec![
            ClusterMember::new("10.0.0.1", 8111, NodeRole::Leader),
            ClusterMember::new("10.0.0.2", 8111, NodeRole::Replica),
        ];
        let (tx, _rx) = oneshot::channel();
        let endpoint = spawn_fake_node(members.clone(), tx).await;

        let mut client = TcpNodeClient::connect(&endpoint, &options()).await.unwrap();

        assert!(client.ping().await.unwrap() < Duration::from_secs(2));
        assert_eq!(client.describe_cluster().await.unwrap(), members);

        let reply = client.request(Bytes::from_static(b"get")).await.unwrap();
        assert_eq!(&reply[..], b"echo:get");

        match client.request(Bytes::from_static(b"fail")).await {
            Err(ClientError::Server(msg)) => assert_eq!(msg, "ValidationException"),
            other => panic!("expected server error, got {:?}", other),
        }

        Box::new(client).close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_failure() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::new("127.0.0.1", port);
        let err = TcpNodeClient::connect(&endpoint, &options())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ConnectFailure { .. }));
    }
}

//! Discovery client: one checksummed request per connection against the
//! hub's discovery endpoint.

use std::time::Duration;

use neoproto::disco::{self, DiscoveryRequest};
use neoproto::ServiceInfo;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::DiscoveryError;

const MAX_DISCO_BYTES: usize = 1024 * 1024;

/// Client for the discovery endpoint.
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl DiscoveryClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register (or renew) a service instance. Returns the instance id the
    /// endpoint acknowledged.
    pub async fn register(&self, service: &ServiceInfo) -> Result<String, DiscoveryError> {
        let params = serde_json::json!({
            "action": "register",
            "service": service,
            "name": service.name,
            "id": service.id,
        });
        let result = self.call("register", params).await?;
        result["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DiscoveryError::Server("register reply without id".to_string()))
    }

    /// Remove the instance with the given id. `false` when it was unknown.
    pub async fn deregister(&self, instance_id: &str) -> Result<bool, DiscoveryError> {
        let result = self
            .call("deregister", serde_json::json!({ "id": instance_id }))
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /// Live instances for a service name.
    pub async fn discover(&self, name: &str) -> Result<Vec<ServiceInfo>, DiscoveryError> {
        let result = self
            .call("discover", serde_json::json!({ "name": name }))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| DiscoveryError::Server(format!("malformed discover reply: {}", e)))
    }

    /// One request/response exchange on a fresh connection.
    async fn call(&self, method: &str, params: Value) -> Result<Value, DiscoveryError> {
        let request = DiscoveryRequest::new(method, params);
        debug!("discovery {} ({})", method, request.msg_id);

        let exchange = async {
            let mut stream = TcpStream::connect((self.host.as_str(), self.port))
                .await
                .map_err(|e| DiscoveryError::Transport(e.to_string()))?;
            let encoded = disco::encode_request(&request)?;
            stream
                .write_all(&encoded)
                .await
                .map_err(|e| DiscoveryError::Transport(e.to_string()))?;

            let (read_half, _) = stream.split();
            let mut reader = BufReader::new(read_half);
            let reply = disco::read_response(&mut reader, MAX_DISCO_BYTES).await?;
            Ok::<_, DiscoveryError>(reply)
        };

        let reply = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| DiscoveryError::Timeout)??;

        match reply.error {
            Some(message) => Err(DiscoveryError::Server(message)),
            None => Ok(reply.result.unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neoproto::disco::DiscoveryReply;
    use std::collections::BTreeMap;
    use tokio::net::TcpListener;

    /// Minimal framing B responder driven by a closure.
    async fn spawn_endpoint<F>(responder: F) -> std::net::SocketAddr
    where
        F: Fn(DiscoveryRequest) -> DiscoveryReply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                let (read_half, mut write_half) = stream.split();
                let mut reader = BufReader::new(read_half);
                while let Ok(Some(request)) =
                    disco::read_request(&mut reader, MAX_DISCO_BYTES).await
                {
                    let reply = responder(request);
                    let encoded = disco::encode_response(&reply).unwrap();
                    if write_half.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            }
        });
        addr
    }

    fn sample_service() -> ServiceInfo {
        ServiceInfo::new(
            "i-1",
            "math",
            "127.0.0.1",
            9091,
            BTreeMap::new(),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn register_returns_acknowledged_id() {
        let addr = spawn_endpoint(|request| {
            assert_eq!(request.method, "register");
            assert_eq!(request.params["name"], "math");
            DiscoveryReply::ok(serde_json::json!({"id": request.params["id"]}))
        })
        .await;

        let client = DiscoveryClient::new("127.0.0.1", addr.port());
        let id = client.register(&sample_service()).await.unwrap();
        assert_eq!(id, "i-1");
    }

    #[tokio::test]
    async fn discover_parses_service_list() {
        let service = sample_service();
        let expected = service.clone();
        let addr = spawn_endpoint(move |request| {
            assert_eq!(request.method, "discover");
            DiscoveryReply::ok(serde_json::json!([expected]))
        })
        .await;

        let client = DiscoveryClient::new("127.0.0.1", addr.port());
        let found = client.discover("math").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, service.id);
    }

    #[tokio::test]
    async fn server_errors_surface() {
        let addr = spawn_endpoint(|_| DiscoveryReply::err("unknown method: nope")).await;
        let client = DiscoveryClient::new("127.0.0.1", addr.port());
        let err = client.discover("math").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Server(message) if message.contains("unknown")));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client =
            DiscoveryClient::new("127.0.0.1", addr.port()).with_timeout(Duration::from_millis(500));
        let err = client.discover("math").await.unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::Transport(_) | DiscoveryError::Timeout
        ));
    }
}

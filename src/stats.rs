//! Client for the Xray stats gRPC service
//!
//! The messages are declared by hand with prost attributes instead of being
//! generated from Xray's proto files; only the fields the panel reads or sets
//! are modelled, unknown fields are skipped on decode.

use crate::error::{XrayError, XrayResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Duration;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Endpoint;
use tracing::debug;

/// Default deadline for dialing and querying the stats endpoint
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

const QUERY_STATS_PATH: &str = "/xray.app.stats.command.StatsService/QueryStats";

/// `xray.app.stats.command.QueryStatsRequest`
#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryStatsRequest {
    /// Substring filter on counter names, empty for all
    #[prost(string, tag = "1")]
    pub pattern: String,
    /// Zero the counters after reading them
    #[prost(bool, tag = "2")]
    pub reset: bool,
}

/// `xray.app.stats.command.Stat`
#[derive(Clone, PartialEq, prost::Message)]
pub struct Stat {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "2")]
    pub value: i64,
}

/// `xray.app.stats.command.QueryStatsResponse`
#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryStatsResponse {
    #[prost(message, repeated, tag = "1")]
    pub stat: Vec<Stat>,
}

/// Source of raw counters for a running process
///
/// Implemented by [`GrpcStatsClient`] in production; tests substitute fakes so
/// traffic caching can be checked without a live binary.
pub trait StatsQuery: Send + Sync {
    fn query_stats(&self, port: u16, reset: bool) -> BoxFuture<'_, XrayResult<Vec<Stat>>>;
}

/// Stats client that dials the loopback gRPC endpoint for every query
#[derive(Debug, Clone)]
pub struct GrpcStatsClient {
    timeout: Duration,
}

impl GrpcStatsClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn query(&self, port: u16, reset: bool) -> XrayResult<Vec<Stat>> {
        // The whole call runs under the deadline in `query_stats`
        let endpoint = Endpoint::from_shared(format!("http://127.0.0.1:{}", port))?
            .connect_timeout(self.timeout);

        let channel = endpoint.connect().await?;
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready().await?;

        let request = tonic::Request::new(QueryStatsRequest {
            pattern: String::new(),
            reset,
        });
        let codec = ProstCodec::<QueryStatsRequest, QueryStatsResponse>::default();
        let response = grpc
            .unary(request, PathAndQuery::from_static(QUERY_STATS_PATH), codec)
            .await?;

        let stats = response.into_inner().stat;
        debug!(port, reset, count = stats.len(), "Queried xray stats");
        Ok(stats)
    }
}

impl Default for GrpcStatsClient {
    fn default() -> Self {
        Self::new(DEFAULT_RPC_TIMEOUT)
    }
}

impl StatsQuery for GrpcStatsClient {
    fn query_stats(&self, port: u16, reset: bool) -> BoxFuture<'_, XrayResult<Vec<Stat>>> {
        let timeout = self.timeout;
        async move {
            tokio::time::timeout(timeout, self.query(port, reset))
                .await
                .map_err(|_| XrayError::RpcTimeout(timeout))?
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_request_encoding() {
        let request = QueryStatsRequest {
            pattern: String::new(),
            reset: true,
        };
        // field 2, varint, value 1
        assert_eq!(request.encode_to_vec(), vec![0x10, 0x01]);

        let empty = QueryStatsRequest::default();
        assert!(empty.encode_to_vec().is_empty());
    }

    #[test]
    fn test_response_decoding() {
        let response = QueryStatsResponse {
            stat: vec![
                Stat {
                    name: "inbound>>>proxy1>>>traffic>>>uplink".to_string(),
                    value: 100,
                },
                Stat {
                    name: "inbound>>>proxy1>>>traffic>>>downlink".to_string(),
                    value: 200,
                },
            ],
        };
        let bytes = response.encode_to_vec();
        let decoded = QueryStatsResponse::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, response);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        // Nothing listens on port 1 on a test machine
        let client = GrpcStatsClient::new(Duration::from_millis(500));
        let result = client.query_stats(1, false).await;
        assert!(matches!(
            result,
            Err(XrayError::RpcConnect(_)) | Err(XrayError::RpcTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_endpoint_times_out() {
        // Accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = GrpcStatsClient::new(Duration::from_millis(500));
        let start = std::time::Instant::now();
        let result = client.query_stats(port, false).await;

        assert!(matches!(result, Err(XrayError::RpcTimeout(_))));
        assert!(start.elapsed() < Duration::from_secs(3));
        server.abort();
    }
}

use log::debug;
use std::fmt;
use std::io;
use std::str::FromStr;
use tokio::net::{lookup_host, TcpStream};

/// An ordered list of relay endpoints; the first one that accepts wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    endpoints: Vec<String>,
}

impl ConnectionTarget {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self { endpoints }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Tries every resolved address of every endpoint in order.
    pub async fn connect(&self) -> io::Result<TcpStream> {
        let mut last_error =
            io::Error::new(io::ErrorKind::NotFound, "connection target has no endpoints");

        for endpoint in &self.endpoints {
            let addrs = match lookup_host(endpoint.as_str()).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    debug!("Failed to resolve {}: {}", endpoint, e);
                    last_error = e;
                    continue;
                }
            };

            for addr in addrs {
                match TcpStream::connect(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        debug!("Failed to connect to {}: {}", addr, e);
                        last_error = e;
                    }
                }
            }
        }

        Err(last_error)
    }
}

impl FromStr for ConnectionTarget {
    type Err = String;

    /// Parses `host:port[,host:port...]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut endpoints = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (host, port) = part
                .rsplit_once(':')
                .ok_or_else(|| format!("endpoint '{}' has no port", part))?;
            if host.is_empty() {
                return Err(format!("endpoint '{}' has no host", part));
            }
            port.parse::<u16>()
                .map_err(|_| format!("endpoint '{}' has an invalid port", part))?;
            endpoints.push(part.to_string());
        }

        if endpoints.is_empty() {
            return Err("no endpoints given".to_string());
        }
        Ok(Self { endpoints })
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoints.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_endpoint_list() {
        let target: ConnectionTarget = "relay.example.net:1234, 127.0.0.1:5000".parse().unwrap();
        assert_eq!(
            target.endpoints(),
            &["relay.example.net:1234".to_string(), "127.0.0.1:5000".to_string()]
        );
        assert_eq!(target.to_string(), "relay.example.net:1234,127.0.0.1:5000");
    }

    #[test]
    fn test_parse_rejects_bad_endpoints() {
        assert!("localhost".parse::<ConnectionTarget>().is_err());
        assert!(":80".parse::<ConnectionTarget>().is_err());
        assert!("host:port".parse::<ConnectionTarget>().is_err());
        assert!("".parse::<ConnectionTarget>().is_err());
    }

    #[test]
    fn test_empty_target_fails_to_connect() {
        let target = ConnectionTarget::new(Vec::new());
        let err = tokio_test::block_on(target.connect()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_first_reachable_endpoint_wins() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let good = listener.local_addr().unwrap();

        // Bind then drop to get a port that refuses connections
        let refused = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let target: ConnectionTarget = format!("{},{}", refused, good).parse().unwrap();
        let stream = target.connect().await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), good);
    }
}

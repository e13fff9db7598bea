#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::{ClientConfig, RootCertStore};
use tcpnet::NetConfig;
use tcpnet::config::TlsFiles;
use tcpnet::net::{Family, Lookup, Network};

/// Lookup answering from fixed tables, never touching the system resolver.
#[derive(Debug, Default)]
pub struct TableLookup {
    pub v4: HashMap<String, IpAddr>,
    pub v6: HashMap<String, IpAddr>,
}

impl TableLookup {
    pub fn with_v4(mut self, host: &str, ip: impl Into<IpAddr>) -> Self {
        self.v4.insert(host.to_owned(), ip.into());
        self
    }

    pub fn with_v6(mut self, host: &str, ip: impl Into<IpAddr>) -> Self {
        self.v6.insert(host.to_owned(), ip.into());
        self
    }
}

impl Lookup for TableLookup {
    fn forward(&self, host: &str, family: Family) -> Option<IpAddr> {
        match family {
            Family::V4 => self.v4.get(host).copied(),
            Family::V6 => self.v6.get(host).copied(),
        }
    }

    fn reverse(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

pub fn network(config: NetConfig, lookup: TableLookup) -> Network {
    Network::with_lookup(config, Arc::new(lookup)).unwrap()
}

/// Runs the network until `done` holds, failing after five seconds.
pub fn drive(net: &mut Network, mut done: impl FnMut(&Network) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(net) {
        assert!(Instant::now() < deadline, "condition not reached: {net:?}");
        net.wait(Duration::from_millis(10)).unwrap();
        net.check_for_connections();
        net.poll_connections();
    }
}

pub fn fixture(name: &str) -> PathBuf {
    [env!("CARGO_MANIFEST_DIR"), "tests", "fixtures", name].iter().collect()
}

/// Certificate and key for `localhost` and `127.0.0.1`, signed by `ca.pem`.
pub fn server_tls_files() -> TlsFiles {
    TlsFiles {
        cert_path: fixture("server.pem"),
        key_path: fixture("server.key"),
    }
}

/// Client configuration trusting only the fixture CA.
pub fn client_tls() -> Arc<ClientConfig> {
    let mut reader = BufReader::new(File::open(fixture("ca.pem")).unwrap());
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert.unwrap()).unwrap();
    }
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

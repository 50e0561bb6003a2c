//! Server and client managers on one in-memory network.
//!
//! # Example
//!
//! ```no_run
//! use tether_integration_tests::fixtures::TwoPeerFixture;
//!
//! #[tokio::test]
//! async fn test_echo() {
//!     let fixture = TwoPeerFixture::new().await;
//!     let (connection, _) = fixture.connect(None, None).await.unwrap();
//!     assert_eq!(connection.request("hi".into(), None).await.unwrap(), "echo hi");
//!     fixture.shutdown().await;
//! }
//! ```

use super::recorder::Recorder;
use std::sync::Arc;
use tether_core::{
    BincodeCodec, ConnectionRef, Credentials, Manager, MemoryUserDirectory, NetworkConfig, Result,
};
use tether_transport::MemoryNetwork;

/// Listener name the server binds
pub const SERVER: &str = "server";

/// A hosting server manager and a client manager
pub struct TwoPeerFixture {
    /// Shared in-memory network
    pub network: MemoryNetwork,
    /// Server manager, hosting at [`SERVER`]
    pub server: Manager<String>,
    /// Server handler
    pub server_events: Arc<Recorder>,
    /// Client manager
    pub client: Manager<String>,
    /// Client handler
    pub client_events: Arc<Recorder>,
    /// Server user directory
    pub directory: Arc<MemoryUserDirectory>,
}

impl TwoPeerFixture {
    /// Both managers on the default configuration.
    pub async fn new() -> Self {
        Self::with_config(NetworkConfig::default()).await
    }

    /// Both managers on `config`.
    ///
    /// # Panics
    ///
    /// Panics if the managers cannot be created or the server cannot bind.
    pub async fn with_config(config: NetworkConfig) -> Self {
        let network = MemoryNetwork::new();
        let directory = Arc::new(MemoryUserDirectory::new());
        let server_events = Recorder::new();
        let client_events = Recorder::new();

        let server = Manager::with_directory(
            config.clone(),
            Arc::new(BincodeCodec::<String>::new()),
            server_events.clone(),
            directory.clone(),
        )
        .expect("server manager");
        server
            .host(Arc::new(network.listener(SERVER)))
            .await
            .expect("server host");

        let client = Manager::new(config, Arc::new(BincodeCodec::<String>::new()), client_events.clone())
            .expect("client manager");

        Self {
            network,
            server,
            server_events,
            client,
            client_events,
            directory,
        }
    }

    /// Connect the client to the server.
    pub async fn connect(
        &self,
        request: Option<&str>,
        credentials: Option<Credentials>,
    ) -> Result<(ConnectionRef<String>, Option<String>)> {
        let link = self.network.dial(SERVER, "client")?;
        self.client
            .connect(link, request.map(str::to_string), credentials)
            .await
    }

    /// Shut the client down, then the server.
    pub async fn shutdown(&self) {
        self.client.shutdown().await;
        self.server.shutdown().await;
    }
}

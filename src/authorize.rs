/// Interactive authorization: show the URL, wait for the redirect
use crate::callback::CallbackServer;
use crate::error::Result;
use crate::oauth::{generate_state, OAuthConfig};
use crate::shutdown::Shutdown;
use std::time::Duration;
use tracing::{info, warn};

/// Source of fresh authorization codes
pub trait Authorizer {
    /// Block until the user has granted access and a code is available
    fn obtain_code(&mut self, shutdown: &Shutdown) -> Result<String>;
}

/// Authorizer backed by the local [`CallbackServer`]
///
/// Binds the callback address first, then prints the authorization URL (and
/// optionally opens it in the default browser) and waits for the redirect.
pub struct CallbackAuthorizer {
    config: OAuthConfig,
    bind_addr: String,
    timeout: Duration,
    open_browser: bool,
}

impl CallbackAuthorizer {
    pub fn new(config: OAuthConfig, bind_addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            config,
            bind_addr: bind_addr.into(),
            timeout,
            open_browser: false,
        }
    }

    /// Also launch the system browser on the authorization URL
    pub fn open_browser(mut self, open: bool) -> Self {
        self.open_browser = open;
        self
    }
}

impl Authorizer for CallbackAuthorizer {
    fn obtain_code(&mut self, shutdown: &Shutdown) -> Result<String> {
        let state = generate_state();
        let server = CallbackServer::bind(self.bind_addr.as_str())?.with_expected_state(&state);
        let url = self.config.authorization_url(&state)?;

        info!(timeout_secs = self.timeout.as_secs(), "waiting for authorization");
        println!("Open the following URL in your browser to authorize access:\n");
        println!("{}\n", url);

        if self.open_browser {
            if let Err(e) = webbrowser::open(&url) {
                warn!(error = %e, "could not open browser");
            }
        }

        server.wait_for_code(self.timeout, shutdown)
    }
}

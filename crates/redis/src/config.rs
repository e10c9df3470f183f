// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const REDIS_DEFAULT_HOST: &str = "127.0.0.1";
pub const REDIS_DEFAULT_PORT: u16 = 6379;

/// Connection settings used verbatim for every connection the transport constructs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// The server host address. If `None`, the local default is used.
    pub host: Option<String>,
    /// The server port. If `None`, the default port is used.
    pub port: Option<u16>,
    /// The account username for the connection.
    pub username: Option<String>,
    /// The account password for the connection.
    pub password: Option<String>,
    /// If the connection should use TLS.
    pub ssl: bool,
    /// The logical database index.
    pub db: Option<i64>,
    /// The timeout (in seconds) to wait for a new connection and its subscriptions.
    pub connection_timeout: u16,
    /// The timeout (in seconds) to wait for a command response.
    pub response_timeout: u16,
}

impl Default for RedisConfig {
    /// Creates a new default [`RedisConfig`] instance.
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            username: None,
            password: None,
            ssl: false,
            db: None,
            connection_timeout: 20,
            response_timeout: 20,
        }
    }
}

impl RedisConfig {
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.connection_timeout))
    }

    #[must_use]
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.response_timeout))
    }
}

/// Builds the connection URL from `config`.
///
/// Returns a tuple of the real URL and a redacted URL safe for logging.
///
/// # Errors
///
/// Returns an error if a username is supplied without a password.
pub fn get_redis_url(config: &RedisConfig) -> anyhow::Result<(String, String)> {
    let host = config.host.as_deref().unwrap_or(REDIS_DEFAULT_HOST);
    let port = config.port.unwrap_or(REDIS_DEFAULT_PORT);
    let username = config.username.as_deref().unwrap_or_default();
    let password = config.password.as_deref().unwrap_or_default();

    // Redact the password for logging: keep the first & last two chars
    let redact_pw = |pw: &str| {
        if pw.chars().count() > 4 {
            let chars: Vec<char> = pw.chars().collect();
            let head: String = chars[..2].iter().collect();
            let tail: String = chars[chars.len() - 2..].iter().collect();
            format!("{head}...{tail}")
        } else {
            "*".repeat(pw.chars().count())
        }
    };

    let (auth, auth_redacted) = match (username.is_empty(), password.is_empty()) {
        (false, false) => (
            format!("{username}:{password}@"),
            format!("{username}:{}@", redact_pw(password)),
        ),
        (true, false) => (format!(":{password}@"), format!(":{}@", redact_pw(password))),
        (false, true) => anyhow::bail!(
            "Redis config error: username supplied without password. \
            Either supply a password or omit the username."
        ),
        (true, true) => (String::new(), String::new()),
    };

    let scheme = if config.ssl { "rediss" } else { "redis" };
    let path = config.db.map(|db| format!("/{db}")).unwrap_or_default();

    let url = format!("{scheme}://{auth}{host}:{port}{path}");
    let redacted_url = format!("{scheme}://{auth_redacted}{host}:{port}{path}");

    Ok((url, redacted_url))
}

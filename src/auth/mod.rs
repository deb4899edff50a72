// Copyright 2026 The prismvnc Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Security handshake configuration and the per-variant handlers.
//!
//! Which security types the server advertises follows from what the host
//! configured: a password enables classic VNC authentication, a
//! username/password predicate plus TLS credentials enables VeNCrypt
//! X509Plain, the predicate alone enables Apple DH, and an RSA key (or
//! the willingness to generate one) enables the RSA-AES family. With no
//! credentials at all only `None` is offered.

use std::sync::Arc;

use tokio_rustls::TlsAcceptor;

use crate::crypto::RsaKeyPair;
use crate::protocol::{
    SECURITY_TYPE_APPLE_DH, SECURITY_TYPE_NONE, SECURITY_TYPE_RSA_AES,
    SECURITY_TYPE_RSA_AES_256, SECURITY_TYPE_VENCRYPT, SECURITY_TYPE_VNC_AUTH,
};

pub mod apple_dh;
pub mod rsa_aes;
pub mod vencrypt;
pub mod vnc;

/// Username/password predicate supplied by the host.
pub type AuthFn = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Security configuration for a server.
#[derive(Default, Clone)]
pub struct SecurityConfig {
    /// Offer the `None` security type.
    pub allow_none: bool,
    /// Password for classic VNC authentication.
    pub password: Option<String>,
    /// Username/password predicate for VeNCrypt, Apple DH and RSA-AES.
    pub auth_fn: Option<AuthFn>,
    /// TLS credentials; required for VeNCrypt X509Plain.
    pub tls: Option<TlsAcceptor>,
    /// RSA server key for the RSA-AES security types.
    pub rsa_keys: Option<Arc<RsaKeyPair>>,
}

impl SecurityConfig {
    /// A configuration offering only `None`, for trusted transports.
    #[must_use]
    pub fn open() -> Self {
        Self { allow_none: true, ..Self::default() }
    }

    /// The security types to advertise, in preference order.
    #[must_use]
    pub fn security_types(&self) -> Vec<u8> {
        let mut types = Vec::new();
        if self.auth_fn.is_some() {
            if self.rsa_keys.is_some() {
                types.push(SECURITY_TYPE_RSA_AES_256);
                types.push(SECURITY_TYPE_RSA_AES);
            }
            if self.tls.is_some() {
                types.push(SECURITY_TYPE_VENCRYPT);
            }
            types.push(SECURITY_TYPE_APPLE_DH);
        }
        if self.password.is_some() {
            types.push(SECURITY_TYPE_VNC_AUTH);
        }
        if self.allow_none || types.is_empty() {
            types.push(SECURITY_TYPE_NONE);
        }
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_offers_none() {
        assert_eq!(SecurityConfig::default().security_types(), vec![SECURITY_TYPE_NONE]);
    }

    #[test]
    fn password_enables_vnc_auth() {
        let config = SecurityConfig {
            password: Some("secret".into()),
            ..SecurityConfig::default()
        };
        assert_eq!(config.security_types(), vec![SECURITY_TYPE_VNC_AUTH]);
    }

    #[test]
    fn predicate_enables_apple_dh() {
        let config = SecurityConfig {
            auth_fn: Some(Arc::new(|_, _| true)),
            ..SecurityConfig::default()
        };
        assert_eq!(config.security_types(), vec![SECURITY_TYPE_APPLE_DH]);
    }

    #[test]
    fn allow_none_is_appended_after_stronger_types() {
        let config = SecurityConfig {
            allow_none: true,
            password: Some("secret".into()),
            ..SecurityConfig::default()
        };
        assert_eq!(
            config.security_types(),
            vec![SECURITY_TYPE_VNC_AUTH, SECURITY_TYPE_NONE]
        );
    }
}

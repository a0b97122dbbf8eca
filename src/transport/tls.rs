// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    sync::{Arc, Mutex, PoisonError},
};

use tokio_rustls::{
    TlsAcceptor, TlsConnector,
    rustls::{ClientConfig, RootCertStore, ServerConfig, pki_types::ServerName},
};

use crate::{
    error::{NetError, NetResult},
    session::{Role, Session},
};

/// TLS configuration shared by every session of a server or client.
///
/// Immutable once configured; sessions only read it. The protocol floor
/// is TLS 1.2 with ephemeral key exchange, which subsumes the legacy
/// "disable SSLv2/SSLv3, single DH use" posture.
#[derive(Default)]
pub struct TlsContext {
    server: Mutex<Option<Arc<ServerConfig>>>,
    client: Mutex<Option<Arc<ClientConfig>>>,
}

impl TlsContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the server side from PEM strings.
    ///
    /// `password` and `dh_pem` exist for interface parity with
    /// OpenSSL-style deployments; the TLS engine manages key exchange
    /// itself and only accepts unencrypted PKCS#8/PKCS#1 keys.
    pub fn set_cert(
        &self,
        _password: &str,
        cert_pem: &str,
        key_pem: &str,
        _dh_pem: &str,
    ) -> NetResult<()> {
        let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| NetError::Config(format!("bad certificate pem: {e}")))?;
        if certs.is_empty() {
            return Err(NetError::Config("no certificate in pem".into()));
        }
        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| NetError::Config(format!("bad private key pem: {e}")))?
            .ok_or_else(|| {
                NetError::Config("no usable private key in pem (encrypted?)".into())
            })?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| NetError::Tls(e.to_string()))?;
        *self.server.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::new(config));
        Ok(())
    }

    /// Configure the server side from PEM files on disk.
    pub fn set_cert_file(
        &self,
        password: &str,
        cert_path: &str,
        key_path: &str,
        dh_path: &str,
    ) -> NetResult<()> {
        let cert = fs::read_to_string(cert_path)
            .map_err(|e| NetError::Config(format!("read {cert_path}: {e}")))?;
        let key = fs::read_to_string(key_path)
            .map_err(|e| NetError::Config(format!("read {key_path}: {e}")))?;
        let dh = if dh_path.is_empty() {
            String::new()
        } else {
            fs::read_to_string(dh_path)
                .map_err(|e| NetError::Config(format!("read {dh_path}: {e}")))?
        };
        self.set_cert(password, &cert, &key, &dh)
    }

    /// Install the client trust anchors from a PEM bundle.
    pub fn set_ca(&self, ca_pem: &str) -> NetResult<()> {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
            let cert =
                cert.map_err(|e| NetError::Config(format!("bad ca pem: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| NetError::Tls(e.to_string()))?;
        }
        if roots.is_empty() {
            return Err(NetError::Config("no trust anchors in pem".into()));
        }
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        *self.client.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::new(config));
        Ok(())
    }

    pub fn set_ca_file(&self, ca_path: &str) -> NetResult<()> {
        let ca = fs::read_to_string(ca_path)
            .map_err(|e| NetError::Config(format!("read {ca_path}: {e}")))?;
        self.set_ca(&ca)
    }

    pub(crate) fn server_config(&self) -> Option<Arc<ServerConfig>> {
        self.server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn client_config(&self) -> Option<Arc<ClientConfig>> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Per-session TLS overlay: wraps the pending TCP stream during the
/// handshake, then reads and writes move bytes over the decrypted stream
/// unchanged.
pub(crate) struct TlsOverlay {
    ctx: Arc<TlsContext>,
}

impl TlsOverlay {
    pub(crate) fn new(ctx: Arc<TlsContext>) -> Self {
        Self { ctx }
    }

    pub(crate) async fn handshake(&self, session: &Arc<Session>) -> NetResult<()> {
        let stream = session
            .take_pending_stream()
            .ok_or(NetError::NotConnected)?;
        match session.role() {
            Role::Server => {
                let config = self.ctx.server_config().ok_or_else(|| {
                    NetError::Config("server certificate not configured".into())
                })?;
                let acceptor = TlsAcceptor::from(config);
                let tls = acceptor.accept(stream).await.map_err(NetError::from)?;
                let (rd, wr) = tokio::io::split(tls);
                session.install_halves(Box::new(rd), Box::new(wr)).await;
            },
            Role::Client => {
                let config = self.ctx.client_config().ok_or_else(|| {
                    NetError::Config("client trust store not configured".into())
                })?;
                let connector = TlsConnector::from(config);
                let host = session
                    .sni_host()
                    .unwrap_or_else(|| "localhost".to_string());
                let name = ServerName::try_from(host)
                    .map_err(|e| NetError::Tls(e.to_string()))?;
                let tls = connector
                    .connect(name, stream)
                    .await
                    .map_err(NetError::from)?;
                let (rd, wr) = tokio::io::split(tls);
                session.install_halves(Box::new(rd), Box::new(wr)).await;
            },
        }
        Ok(())
    }
}

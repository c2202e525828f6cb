// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Management-plane authentication.
//!
//! One policy, two checkpoints. A request passes iff it arrived on the
//! local socket (whose accept loop already verified OS peer
//! credentials), or over TCP whose handshake required and verified a
//! client certificate. Each listener is built with the [`AuthMode`]
//! matching what its transport guarantees, and the interceptor rejects
//! everything else before any non-health method runs.

use tonic::service::Interceptor;
use tonic::{Request, Status};
use tracing::warn;

/// What the underlying listener has already proven about a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Local socket; peer credentials checked at accept time.
    LocalSocket,
    /// TLS with a required-and-verified client certificate.
    Mtls,
    /// Plain TCP or server-only TLS. Management calls are refused.
    Insecure,
}

/// Runs before every non-health management method.
#[derive(Debug, Clone)]
pub struct AuthInterceptor {
    mode: AuthMode,
}

impl AuthInterceptor {
    pub fn new(mode: AuthMode) -> Self {
        AuthInterceptor { mode }
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        match self.mode {
            AuthMode::LocalSocket | AuthMode::Mtls => Ok(request),
            AuthMode::Insecure => Err(Status::permission_denied(
                "security violation: management requires mTLS or the local socket",
            )),
        }
    }
}

/// Effective UID of this process.
#[cfg(unix)]
pub fn process_uid() -> u32 {
    // Safety: geteuid cannot fail.
    unsafe { libc::geteuid() }
}

#[cfg(not(unix))]
pub fn process_uid() -> u32 {
    0
}

/// Local-socket admission: root or the process owner only.
pub fn peer_allowed(peer_uid: u32) -> bool {
    peer_uid == 0 || peer_uid == process_uid()
}

/// Accept loop for the local socket: peer credentials are checked before
/// a connection ever reaches gRPC. Rejected peers are logged and
/// dropped.
#[cfg(unix)]
pub fn uds_incoming(
    listener: tokio::net::UnixListener,
) -> impl tokio_stream::Stream<Item = std::io::Result<tokio::net::UnixStream>> {
    async_stream::stream! {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => match stream.peer_cred() {
                    Ok(cred) if peer_allowed(cred.uid()) => yield Ok(stream),
                    Ok(cred) => {
                        warn!(uid = cred.uid(), "unauthorized local-socket peer rejected");
                    }
                    Err(err) => {
                        warn!(error = %err, "peer credential check failed; rejecting");
                    }
                },
                Err(err) => yield Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_socket_and_mtls_pass() {
        for mode in [AuthMode::LocalSocket, AuthMode::Mtls] {
            let mut interceptor = AuthInterceptor::new(mode);
            assert!(interceptor.call(Request::new(())).is_ok(), "{mode:?}");
        }
    }

    #[test]
    fn insecure_transport_is_rejected() {
        let mut interceptor = AuthInterceptor::new(AuthMode::Insecure);
        let status = interceptor.call(Request::new(())).unwrap_err();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
        assert!(status.message().contains("security violation"));
    }

    #[test]
    fn owner_and_root_pass_peer_check() {
        assert!(peer_allowed(0));
        assert!(peer_allowed(process_uid()));
    }

    #[test]
    fn foreign_uid_fails_peer_check() {
        let foreign = process_uid().wrapping_add(12345).max(1);
        if foreign != process_uid() {
            assert!(!peer_allowed(foreign));
        }
    }
}

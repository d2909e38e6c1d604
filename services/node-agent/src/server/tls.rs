//! OpenSSL acceptor for the inbound API.

use std::pin::Pin;

use openssl::pkey::PKey;
use openssl::ssl::{
    select_next_proto, AlpnError, Ssl, SslAcceptor, SslMethod, SslVerifyMode,
};
use openssl::stack::Stack;
use openssl::x509::{X509Name, X509VerifyResult, X509};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::error::{Error, Result};
use crate::tls::KeyPair;

use super::PeerIdentity;

const ALPN_PROTO_LIST: &[u8] = b"\x08http/1.1";

fn tls_error(context: &str) -> impl FnOnce(openssl::error::ErrorStack) -> Error + '_ {
    move |e| Error::Config(format!("{context}: {e}"))
}

/// Build the acceptor from the serving key pair.
///
/// With `client_ca_pem`, client certificates are requested and checked
/// against that CA; a failed check is surfaced through [`peer_identity`]
/// rather than aborting the handshake, so bearer tokens still work.
pub fn build_acceptor(pair: &KeyPair, client_ca_pem: Option<&[u8]>) -> Result<SslAcceptor> {
    let cert = X509::from_pem(&pair.cert_pem).map_err(tls_error("invalid serving certificate"))?;
    let key = PKey::private_key_from_pem(&pair.key_pem).map_err(tls_error("invalid serving key"))?;

    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())
        .map_err(tls_error("failed to initialise TLS acceptor"))?;
    builder
        .set_private_key(&key)
        .map_err(tls_error("failed to attach serving key"))?;
    builder
        .set_certificate(&cert)
        .map_err(tls_error("failed to attach serving certificate"))?;
    builder
        .check_private_key()
        .map_err(tls_error("serving certificate and key mismatch"))?;

    if let Some(ca_pem) = client_ca_pem {
        let cas = X509::stack_from_pem(ca_pem).map_err(tls_error("invalid client CA bundle"))?;
        if cas.is_empty() {
            return Err(Error::Config("client CA bundle contains no certificates".into()));
        }

        let mut names = Stack::<X509Name>::new().map_err(tls_error("failed to prepare CA list"))?;
        for ca in cas {
            let subject = ca
                .subject_name()
                .to_owned()
                .map_err(tls_error("failed to copy CA subject"))?;
            names.push(subject).map_err(tls_error("failed to register CA subject"))?;
            builder
                .cert_store_mut()
                .add_cert(ca)
                .map_err(tls_error("failed to add client CA"))?;
        }
        builder.set_client_ca_list(names);
        builder.set_verify_callback(SslVerifyMode::PEER, |_, _| true);
    }

    builder
        .set_session_id_context(b"virtual-node")
        .map_err(tls_error("failed to set session context"))?;
    builder
        .set_alpn_protos(ALPN_PROTO_LIST)
        .map_err(tls_error("failed to configure ALPN"))?;
    builder.set_alpn_select_callback(|_, client| {
        select_next_proto(client, ALPN_PROTO_LIST).ok_or(AlpnError::NOACK)
    });

    Ok(builder.build())
}

/// Run the server side of the TLS handshake.
pub async fn accept(acceptor: &SslAcceptor, stream: TcpStream) -> Result<SslStream<TcpStream>> {
    let ssl = Ssl::new(acceptor.context())
        .map_err(|e| Error::Internal(format!("failed to initialise TLS session: {e}")))?;
    let mut tls_stream = SslStream::new(ssl, stream)
        .map_err(|e| Error::Internal(format!("failed to bind TLS stream: {e}")))?;
    Pin::new(&mut tls_stream)
        .accept()
        .await
        .map_err(|e| Error::InvalidArgument(format!("TLS handshake failed: {e}")))?;
    Ok(tls_stream)
}

/// Identity established by the handshake.
pub fn peer_identity(stream: &SslStream<TcpStream>) -> PeerIdentity {
    let ssl = stream.ssl();
    let Some(cert) = ssl.peer_certificate() else {
        return PeerIdentity::Anonymous;
    };
    if ssl.verify_result() != X509VerifyResult::OK {
        return PeerIdentity::Rejected(ssl.verify_result().error_string().to_string());
    }

    let subject = cert
        .subject_name()
        .entries_by_nid(openssl::nid::Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
        .unwrap_or_default();
    PeerIdentity::Verified(subject)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::generate_self_signed;

    #[test]
    fn test_acceptor_from_generated_pair() {
        let pair = generate_self_signed("vn-1", &["localhost".to_string()]).unwrap();
        assert!(build_acceptor(&pair, None).is_ok());
        assert!(build_acceptor(&pair, Some(&pair.cert_pem)).is_ok());
    }

    #[test]
    fn test_rejects_empty_ca_bundle() {
        let pair = generate_self_signed("vn-1", &[]).unwrap();
        let result = build_acceptor(&pair, Some(b""));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}

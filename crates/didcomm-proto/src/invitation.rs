//! Out-of-band invitation URLs.
//!
//! An invitation travels outside any connection, usually as a link or QR
//! code: `<endpoint>?c_i=<base64url(invitation JSON)>`. Decoders accept
//! padded and unpadded base64url as well as standard base64, since agents in
//! the wild emit all three.

use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD},
};

use crate::{
    envelope::Envelope,
    errors::{ProtocolError, Result},
};

/// Query parameter carrying the encoded invitation
pub const INVITATION_PARAM: &str = "c_i";

/// Build an invitation URL rooted at `base`
pub fn encode_url(base: &str, invitation: &Envelope) -> Result<String> {
    let json = invitation.encode()?;
    let separator = if base.contains('?') { '&' } else { '?' };
    Ok(format!("{base}{separator}{INVITATION_PARAM}={}", URL_SAFE_NO_PAD.encode(json)))
}

/// Extract the invitation JSON body from a URL
pub fn decode_url(url: &str) -> Result<Vec<u8>> {
    let (_, query) = url
        .split_once('?')
        .ok_or_else(|| ProtocolError::InvalidInvitationUrl("missing query".into()))?;

    let encoded = query
        .split('&')
        .find_map(|pair| pair.strip_prefix(INVITATION_PARAM)?.strip_prefix('='))
        .ok_or_else(|| ProtocolError::InvalidInvitationUrl(format!("missing {INVITATION_PARAM}")))?;

    URL_SAFE_NO_PAD
        .decode(encoded)
        .or_else(|_| URL_SAFE.decode(encoded))
        .or_else(|_| STANDARD.decode(encoded))
        .map_err(|e| ProtocolError::InvalidInvitationUrl(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        envelope::RawEnvelope,
        ids::{AgentId, ThreadId},
        kind::ConnectionMessage,
        payloads::Invitation,
    };

    fn invitation() -> Envelope {
        Envelope::with_payload(
            ConnectionMessage::Invitation.message_type(),
            ThreadId::new("inv-1"),
            AgentId::new("issuer"),
            &Invitation {
                label: "Issuer".into(),
                service_endpoint: Some("issuer".into()),
                recipient_keys: vec![],
            },
        )
        .unwrap()
    }

    #[test]
    fn url_carries_the_invitation() {
        let url = encode_url("didcomm://issuer", &invitation()).unwrap();
        assert!(url.starts_with("didcomm://issuer?c_i="));

        let body = decode_url(&url).unwrap();
        let decoded = Envelope::decode(&RawEnvelope::new(AgentId::new("x"), body)).unwrap();
        let payload: Invitation = decoded.payload().unwrap();
        assert_eq!(payload.label, "Issuer");
        assert_eq!(decoded.thread_id, ThreadId::new("inv-1"));
    }

    #[test]
    fn appends_to_existing_query() {
        let url = encode_url("https://agent.example/?lang=en", &invitation()).unwrap();
        assert!(url.contains("?lang=en&c_i="));
        assert!(decode_url(&url).is_ok());
    }

    #[test]
    fn accepts_padded_standard_base64() {
        let url = format!("https://x/?c_i={}", STANDARD.encode(br#"{"a":1}"#));
        assert_eq!(decode_url(&url).unwrap(), br#"{"a":1}"#);
    }

    #[test]
    fn rejects_missing_parameter() {
        assert!(matches!(
            decode_url("https://x/?foo=bar"),
            Err(ProtocolError::InvalidInvitationUrl(_))
        ));
        assert!(decode_url("no-query").is_err());
    }
}

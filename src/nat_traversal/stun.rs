/**
 * nat_traversal/stun.rs
 *
 * STUN client for public address discovery (RFC 5389 subset)
 */

use log::debug;
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;

use super::error::{Result, TraversalError};
use super::types::NatClass;

/// STUN message types
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;

/// STUN magic cookie
const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN attribute types
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Deadline for a single binding request; there is no retransmission
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// STUN client
pub struct StunClient {
    server: String,
    alternate: Option<String>,
}

impl StunClient {
    /// Create a new STUN client
    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            alternate: None,
        }
    }

    /// Create a client with an alternate server for NAT classification
    pub fn with_alternate(server: &str, alternate: &str) -> Self {
        Self {
            server: server.to_string(),
            alternate: Some(alternate.to_string()),
        }
    }

    /// Query the server for the externally visible address of this host.
    ///
    /// A non-zero `local_port` is bound exactly as given; the discovered
    /// mapping only holds for traffic leaving that same port, so a bind
    /// failure is an error rather than a silent rebind elsewhere.
    pub async fn public_address(&self, local_port: u16) -> Result<(IpAddr, u16)> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port))
            .await
            .map_err(|e| {
                TraversalError::NetworkUnavailable(format!(
                    "Failed to bind UDP port {}: {}",
                    local_port, e
                ))
            })?;

        let server_addr = lookup_host(self.server.as_str())
            .await
            .map_err(|e| {
                TraversalError::NetworkUnavailable(format!(
                    "Failed to resolve STUN server {}: {}",
                    self.server, e
                ))
            })?
            .next()
            .ok_or_else(|| {
                TraversalError::NetworkUnavailable(format!(
                    "No address found for STUN server {}",
                    self.server
                ))
            })?;

        let transaction_id: [u8; 12] = rand::random();
        let request = build_binding_request(&transaction_id);

        socket.send_to(&request, server_addr).await.map_err(|e| {
            TraversalError::NetworkUnavailable(format!("Failed to send STUN request: {}", e))
        })?;

        let mut buffer = [0u8; 1024];
        let (len, _) = timeout(QUERY_TIMEOUT, socket.recv_from(&mut buffer))
            .await
            .map_err(|_| {
                TraversalError::Timeout(format!(
                    "No STUN response from {} within {:?}",
                    self.server, QUERY_TIMEOUT
                ))
            })?
            .map_err(|e| {
                TraversalError::NetworkUnavailable(format!(
                    "Failed to receive STUN response: {}",
                    e
                ))
            })?;

        parse_binding_response(&buffer[..len], &transaction_id)
    }

    /// Classify the NAT by comparing two external mappings, one from the
    /// primary server and one from the alternate. Without an alternate,
    /// or when the alternate fails, the primary is queried again.
    pub async fn detect_nat_class(&self) -> Result<NatClass> {
        let first = self.public_address(0).await?;

        let second = match &self.alternate {
            Some(alternate) => match StunClient::new(alternate).public_address(0).await {
                Ok(mapping) => mapping,
                Err(e) => {
                    debug!(
                        "alternate STUN server {} failed: {}, retrying primary",
                        alternate, e
                    );
                    self.public_address(0).await?
                }
            },
            None => self.public_address(0).await?,
        };

        if first == second {
            Ok(NatClass::Open)
        } else {
            Ok(NatClass::Restricted)
        }
    }
}

/// Build a STUN binding request with no attributes
fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut request = Vec::with_capacity(20);

    // Message type, message length, magic cookie, transaction ID
    request.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    request.extend_from_slice(&0u16.to_be_bytes());
    request.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    request.extend_from_slice(transaction_id);

    request
}

/// Parse a STUN binding response. XOR-MAPPED-ADDRESS is preferred over
/// MAPPED-ADDRESS whenever both are present, regardless of which one
/// appears first in the attribute list.
fn parse_binding_response(
    data: &[u8],
    expected_transaction_id: &[u8; 12],
) -> Result<(IpAddr, u16)> {
    if data.len() < 20 {
        return Err(TraversalError::ProtocolViolation(
            "STUN response too short".into(),
        ));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != STUN_BINDING_RESPONSE {
        return Err(TraversalError::ProtocolViolation(format!(
            "Invalid STUN response type: 0x{:04x}",
            msg_type
        )));
    }

    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if magic != STUN_MAGIC_COOKIE {
        return Err(TraversalError::ProtocolViolation(
            "Invalid magic cookie".into(),
        ));
    }

    if &data[8..20] != expected_transaction_id {
        return Err(TraversalError::ProtocolViolation(
            "Transaction ID mismatch".into(),
        ));
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() < 20 + msg_len {
        return Err(TraversalError::ProtocolViolation(
            "STUN response truncated".into(),
        ));
    }

    let mut xor_mapped = None;
    let mut mapped = None;

    let mut offset = 20;
    while offset + 4 <= 20 + msg_len {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;

        if offset + attr_len > data.len() {
            break;
        }

        let attr_data = &data[offset..offset + attr_len];

        if attr_type == ATTR_XOR_MAPPED_ADDRESS {
            xor_mapped = Some(parse_address_attribute(
                attr_data,
                true,
                expected_transaction_id,
            )?);
        } else if attr_type == ATTR_MAPPED_ADDRESS {
            mapped = Some(parse_address_attribute(
                attr_data,
                false,
                expected_transaction_id,
            )?);
        }

        // Attributes are padded to 4-byte boundaries
        offset += (attr_len + 3) & !3;
    }

    xor_mapped.or(mapped).ok_or_else(|| {
        TraversalError::ProtocolViolation("No address attribute found in STUN response".into())
    })
}

/// Decode a MAPPED-ADDRESS or XOR-MAPPED-ADDRESS attribute
fn parse_address_attribute(
    data: &[u8],
    xor: bool,
    transaction_id: &[u8; 12],
) -> Result<(IpAddr, u16)> {
    if data.len() < 8 {
        return Err(TraversalError::ProtocolViolation(
            "Address attribute too short".into(),
        ));
    }

    let family = data[1];
    let mut port = u16::from_be_bytes([data[2], data[3]]);
    if xor {
        port ^= (STUN_MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        0x01 => {
            let mut addr = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            if xor {
                addr ^= STUN_MAGIC_COOKIE;
            }
            IpAddr::from(addr.to_be_bytes())
        }
        0x02 => {
            if data.len() < 20 {
                return Err(TraversalError::ProtocolViolation(
                    "Invalid IPv6 address length".into(),
                ));
            }
            let mut addr_bytes = [0u8; 16];
            addr_bytes.copy_from_slice(&data[4..20]);

            if xor {
                // XOR with magic cookie + transaction ID
                let mut xor_key = [0u8; 16];
                xor_key[0..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
                xor_key[4..16].copy_from_slice(transaction_id);

                for i in 0..16 {
                    addr_bytes[i] ^= xor_key[i];
                }
            }
            IpAddr::from(addr_bytes)
        }
        _ => {
            return Err(TraversalError::ProtocolViolation(format!(
                "Unknown address family: {}",
                family
            )));
        }
    };

    Ok((ip, port))
}

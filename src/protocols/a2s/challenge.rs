use super::packet::{build_request, QueryType, ResponseType, CHALLENGE_REQUEST, HEADER};
use crate::{errors::Result, transport::Transport, util::BinaryCursor};

use num_traits::FromPrimitive;
use tracing::debug;

pub type Challenge = [u8; 4];

/// Pulls the token out of a challenge reply: marker, type byte, then four raw bytes.
///
/// The bytes are taken whatever the type byte says. Servers that do not challenge answer the
/// stub with the data itself, and echoing those bytes back still gets a full reply.
pub fn parse_challenge(data: &[u8]) -> Result<Challenge> {
    let mut cursor = BinaryCursor::new(data);
    cursor.skip(HEADER.len())?;
    let ty = cursor.read_u8()?;
    if ResponseType::from_u8(ty) != Some(ResponseType::Challenge) {
        debug!("Challenge requested, got reply type {:#04x}", ty);
    }
    cursor.read_array()
}

/// Asks the server for a challenge token for `query_type`. No retries.
pub fn get_challenge(transport: &mut dyn Transport, query_type: QueryType) -> Result<Challenge> {
    transport.send(&build_request(query_type, &CHALLENGE_REQUEST))?;
    let reply = transport.recv()?;
    let challenge = parse_challenge(&reply.data)?;
    debug!(
        "Got {:?} challenge {} from {}",
        query_type,
        hex::encode(challenge),
        reply.addr
    );
    Ok(challenge)
}

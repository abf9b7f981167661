//! Decoders for reply payloads. Each takes the bytes following the single-packet marker, starting
//! at the response type byte.

use super::packet::ResponseType;
use crate::{
    errors::{Error, Result},
    models::{ExtraData, Os, Player, Rule, ServerInfo},
    util::BinaryCursor,
};

use num_traits::FromPrimitive;
use tracing::debug;

const EDF_PORT: u8 = 0x80;
const EDF_STEAM_ID: u8 = 0x10;
const EDF_SOURCE_TV: u8 = 0x40;
const EDF_KEYWORDS: u8 = 0x20;
const EDF_GAME_ID: u8 = 0x01;

fn expect_type(cursor: &mut BinaryCursor, expected: ResponseType) -> Result<()> {
    let ty = cursor.read_u8()?;
    if ResponseType::from_u8(ty) != Some(expected) {
        return Err(Error::UnexpectedResponse(ty));
    }
    Ok(())
}

fn parse_extra(cursor: &mut BinaryCursor) -> Result<ExtraData> {
    let mut extra = ExtraData::default();
    if cursor.is_empty() {
        return Ok(extra);
    }

    let edf = cursor.read_u8()?;
    if edf & EDF_PORT != 0 {
        extra.port = Some(cursor.read_u16_le()?);
    }
    if edf & EDF_STEAM_ID != 0 {
        extra.steam_id = Some(cursor.read_u64_le()?);
    }
    if edf & EDF_SOURCE_TV != 0 {
        extra.tv_port = Some(cursor.read_u16_le()?);
        extra.tv_name = Some(cursor.read_cstring());
    }
    if edf & EDF_KEYWORDS != 0 {
        extra.keywords = Some(cursor.read_cstring());
    }
    if edf & EDF_GAME_ID != 0 {
        extra.game_id = Some(cursor.read_u64_le()?);
    }

    Ok(extra)
}

pub fn parse_info(payload: &[u8]) -> Result<ServerInfo> {
    let mut cursor = BinaryCursor::new(payload);
    expect_type(&mut cursor, ResponseType::Info)?;

    Ok(ServerInfo {
        protocol: cursor.read_u8()?,
        name: cursor.read_cstring(),
        map: cursor.read_cstring(),
        folder: cursor.read_cstring(),
        game: cursor.read_cstring(),
        app_id: cursor.read_i16_le()?,
        players: cursor.read_u8()?.into(),
        max_players: cursor.read_u8()?.into(),
        bots: cursor.read_u8()?.into(),
        dedicated: cursor.read_u8()? == b'd',
        os: Os::from(cursor.read_u8()?),
        password: cursor.read_u8()? != 0,
        secure: cursor.read_u8()? != 0,
        version: cursor.read_cstring(),
        extra: parse_extra(&mut cursor)?,
    })
}

pub fn parse_players(payload: &[u8]) -> Result<Vec<Player>> {
    let mut cursor = BinaryCursor::new(payload);
    expect_type(&mut cursor, ResponseType::Player)?;

    let count = cursor.read_u8()?;
    let mut players = Vec::with_capacity(count.into());
    for _ in 0..count {
        // Slot index, always zero on current servers.
        cursor.skip(1)?;
        players.push(Player {
            name: cursor.read_cstring(),
            score: cursor.read_i32_le()?,
            duration: cursor.read_f32_le()?,
        });
    }

    Ok(players)
}

pub fn parse_rules(payload: &[u8]) -> Result<Vec<Rule>> {
    let mut cursor = BinaryCursor::new(payload);
    let marker = cursor.read_u8()?;
    if ResponseType::from_u8(marker) != Some(ResponseType::Rules) {
        debug!("Rules reply starts with {:#04x}", marker);
    }

    let count = cursor.read_i16_le()?.max(0) as usize;
    let mut rules = Vec::with_capacity(count.min(cursor.remaining()));
    for _ in 0..count {
        // Servers that overflow a datagram may announce more rules than they send.
        if cursor.is_empty() {
            break;
        }
        rules.push(Rule {
            name: cursor.read_cstring(),
            value: cursor.read_cstring(),
        });
    }

    Ok(rules)
}

//! Source Engine query protocol (A2S).
//!
//! `SourceQuery` talks to one server. Info replies never fail: a server that cannot be queried
//! yields `ServerInfo::unavailable`. Player and rule queries return an error instead, so callers
//! get no record at all.

pub mod challenge;
pub mod packet;
pub mod parse;
pub mod split;

use self::{
    challenge::{get_challenge, parse_challenge},
    packet::{build_request, classify, Datagram, QueryType, ResponseType, INFO_PAYLOAD},
};
use crate::{
    dns,
    errors::{Error, Result},
    models::{Host, Player, QueryConfig, Rule, ServerInfo},
    transport::{Connector, SocketKind, Transport, UdpConnector},
};

use bytes::{BufMut, BytesMut};
use num_traits::FromPrimitive;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Returns the reply payload starting at the type byte, reassembling split replies.
fn read_payload(transport: &mut dyn Transport, data: &[u8]) -> Result<Vec<u8>> {
    match classify(data)? {
        Datagram::Single(payload) => Ok(payload.to_vec()),
        Datagram::Split(body) => split::collect(transport, body),
    }
}

fn is_challenge(data: &[u8]) -> bool {
    match classify(data) {
        Ok(Datagram::Single(p)) => p
            .first()
            .and_then(|&ty| ResponseType::from_u8(ty))
            .map_or(false, |ty| ty == ResponseType::Challenge),
        _ => false,
    }
}

fn report(host: &Host, query: &str, e: &Error) {
    if e.is_corruption() {
        error!("{} query to {:?} returned corrupt data: {}", query, host, e);
    } else {
        warn!("{} query to {:?} failed: {}", query, host, e);
    }
}

/// Query client for a single server.
pub struct SourceQuery {
    host: Host,
    config: QueryConfig,
    connector: Box<dyn Connector>,
    single: Option<Box<dyn Transport>>,
    multi: Option<Box<dyn Transport>>,
}

impl SourceQuery {
    pub fn new(host: impl Into<Host>) -> Self {
        Self::with_connector(host, UdpConnector)
    }

    pub fn with_connector(host: impl Into<Host>, connector: impl Connector + 'static) -> Self {
        Self {
            host: host.into(),
            config: QueryConfig::default(),
            connector: Box::new(connector),
            single: None,
            multi: None,
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Points the client at another server. Open sockets are closed.
    pub fn set_host(&mut self, host: impl Into<Host>) {
        self.cleanup();
        self.host = host.into();
    }

    pub fn set_send_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.config.send_timeout = timeout;
        self.apply_timeouts()
    }

    pub fn set_recv_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.config.recv_timeout = timeout;
        self.apply_timeouts()
    }

    /// Replaces the whole configuration. Sockets are reopened on next use.
    pub fn set_config(&mut self, config: QueryConfig) {
        self.cleanup();
        self.config = config;
    }

    fn apply_timeouts(&mut self) -> Result<()> {
        let (send, recv) = (self.config.send_timeout, self.config.recv_timeout);
        for t in self.single.iter_mut().chain(self.multi.iter_mut()) {
            t.set_timeouts(send, recv)?;
        }
        Ok(())
    }

    /// Closes both sockets.
    pub fn cleanup(&mut self) {
        let (single, multi) = (self.single.take(), self.multi.take());
        if single.is_some() || multi.is_some() {
            debug!("Closing transports to {:?}", self.host);
        }
    }

    fn transport(&mut self, kind: SocketKind) -> Result<&mut (dyn Transport + 'static)> {
        let slot = match kind {
            SocketKind::Single => &mut self.single,
            SocketKind::Multi => &mut self.multi,
        };
        if slot.is_none() {
            let addr = dns::resolve_host(&self.host)?;
            *slot = Some(self.connector.connect(addr, kind, &self.config)?);
        }
        slot.as_deref_mut().ok_or(Error::NotConnected)
    }

    /// A2S_INFO. Falls back to `ServerInfo::unavailable` on any failure.
    pub fn server_info(&mut self) -> ServerInfo {
        match self.try_server_info() {
            Ok(info) => info,
            Err(e) => {
                report(&self.host, "Info", &e);
                ServerInfo::unavailable(if e.is_timeout() {
                    "request timed out"
                } else if e.is_corruption() {
                    "corrupt response"
                } else {
                    "request failed"
                })
            }
        }
    }

    /// A2S_INFO with the failure exposed.
    pub fn try_server_info(&mut self) -> Result<ServerInfo> {
        let transport = self.transport(SocketKind::Single)?;

        transport.send(&build_request(QueryType::Info, INFO_PAYLOAD))?;
        let mut reply = transport.recv()?;

        if is_challenge(&reply.data) {
            let challenge = parse_challenge(&reply.data)?;
            debug!("Info request challenged with {}", hex::encode(challenge));

            let mut payload = BytesMut::with_capacity(INFO_PAYLOAD.len() + challenge.len());
            payload.put_slice(INFO_PAYLOAD);
            payload.put_slice(&challenge);
            transport.send(&build_request(QueryType::Info, &payload))?;
            reply = transport.recv()?;
        }

        parse::parse_info(&read_payload(transport, &reply.data)?)
    }

    /// A2S_PLAYER.
    pub fn players(&mut self) -> Result<Vec<Player>> {
        let result = self.fetch_players();
        if let Err(e) = &result {
            report(&self.host, "Player", e);
        }
        result
    }

    fn fetch_players(&mut self) -> Result<Vec<Player>> {
        let transport = self.transport(SocketKind::Single)?;

        let challenge = get_challenge(transport, QueryType::Player)?;
        transport.send(&build_request(QueryType::Player, &challenge))?;
        let reply = transport.recv()?;

        parse::parse_players(&read_payload(transport, &reply.data)?)
    }

    /// A2S_RULES. Runs on the sender-aware socket since replies are commonly split.
    pub fn rules(&mut self) -> Result<Vec<Rule>> {
        let result = self.fetch_rules();
        if let Err(e) = &result {
            report(&self.host, "Rules", e);
        }
        result
    }

    fn fetch_rules(&mut self) -> Result<Vec<Rule>> {
        let transport = self.transport(SocketKind::Multi)?;

        let challenge = get_challenge(transport, QueryType::Rules)?;
        transport.send(&build_request(QueryType::Rules, &challenge))?;
        let reply = transport.recv()?;

        parse::parse_rules(&read_payload(transport, &reply.data)?)
    }
}

impl Drop for SourceQuery {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::{
        packet::{parse_request, CHALLENGE_REQUEST, HEADER},
        parse::fixtures::*,
        *,
    };
    use crate::{
        models::{Os, Packet},
        protocols::helpers::{checksum, compress},
    };
    use std::{
        collections::{HashMap, VecDeque},
        net::{SocketAddr, UdpSocket},
        sync::{Arc, Mutex},
        thread,
    };

    const TOKEN: [u8; 4] = [0x4B, 0xA1, 0x19, 0x05];

    #[derive(Default)]
    struct Script {
        /// `None` simulates a receive timeout.
        replies: HashMap<SocketKind, VecDeque<Option<Vec<u8>>>>,
        sent: Vec<(SocketKind, Vec<u8>)>,
        connects: Vec<(SocketAddr, SocketKind)>,
    }

    #[derive(Clone, Default)]
    struct ScriptedConnector(Arc<Mutex<Script>>);

    impl ScriptedConnector {
        fn reply(&self, kind: SocketKind, data: Vec<u8>) -> &Self {
            self.0
                .lock()
                .unwrap()
                .replies
                .entry(kind)
                .or_default()
                .push_back(Some(data));
            self
        }

        fn sent(&self) -> Vec<(SocketKind, Vec<u8>)> {
            self.0.lock().unwrap().sent.clone()
        }

        fn connects(&self) -> usize {
            self.0.lock().unwrap().connects.len()
        }
    }

    struct ScriptedTransport {
        script: Arc<Mutex<Script>>,
        addr: SocketAddr,
        kind: SocketKind,
    }

    impl Connector for ScriptedConnector {
        fn connect(
            &self,
            addr: SocketAddr,
            kind: SocketKind,
            _: &QueryConfig,
        ) -> Result<Box<dyn Transport>> {
            self.0.lock().unwrap().connects.push((addr, kind));
            Ok(Box::new(ScriptedTransport {
                script: self.0.clone(),
                addr,
                kind,
            }))
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&mut self, data: &[u8]) -> Result<()> {
            self.script
                .lock()
                .unwrap()
                .sent
                .push((self.kind, data.to_vec()));
            Ok(())
        }

        fn recv(&mut self) -> Result<Packet> {
            let next = self
                .script
                .lock()
                .unwrap()
                .replies
                .get_mut(&self.kind)
                .and_then(VecDeque::pop_front)
                .flatten();
            match next {
                Some(data) => Ok(Packet {
                    addr: self.addr,
                    data,
                }),
                None => Err(Error::TransportTimeout),
            }
        }

        fn set_timeouts(&mut self, _: Duration, _: Duration) -> Result<()> {
            Ok(())
        }
    }

    fn single(payload: &[u8]) -> Vec<u8> {
        [&HEADER[..], payload].concat()
    }

    fn challenge_reply() -> Vec<u8> {
        single(&[&[0x41u8][..], &TOKEN[..]].concat())
    }

    fn split_datagram(
        id: u32,
        total: u8,
        index: u8,
        decompressed: Option<(u32, u32)>,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut out = BytesMut::new();
        out.put_i32_le(-2);
        out.put_u32_le(id);
        out.put_u8(total);
        out.put_u8(index);
        out.put_u16_le(1248);
        if let Some((size, crc)) = decompressed {
            out.put_u32_le(size);
            out.put_u32_le(crc);
        }
        out.put_slice(payload);
        out.to_vec()
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:27015".parse().unwrap()
    }

    fn query(connector: &ScriptedConnector) -> SourceQuery {
        SourceQuery::with_connector(addr(), connector.clone())
    }

    #[test]
    fn test_server_info() {
        let connector = ScriptedConnector::default();
        connector.reply(SocketKind::Single, single(&info_payload()));

        let info = query(&connector).server_info();

        assert_eq!(info.name, "Test Server");
        assert_eq!(info.map, "de_dust2");
        assert_eq!(info.app_id, 240);
        assert_eq!(info.players, 5);
        assert_eq!(info.max_players, 10);
        assert!(info.dedicated);
        assert_eq!(info.os, Os::Linux);
        assert!(!info.password);
        assert!(info.secure);
        assert_eq!(info.version, "1.0");

        let sent = connector.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            (
                SocketKind::Single,
                b"\xFF\xFF\xFF\xFFTSource Engine Query\x00".to_vec()
            )
        );
    }

    #[test]
    fn test_server_info_challenged() {
        let connector = ScriptedConnector::default();
        connector
            .reply(SocketKind::Single, challenge_reply())
            .reply(SocketKind::Single, single(&info_payload()));

        let info = query(&connector).server_info();
        assert!(info.is_available());

        let sent = connector.sent();
        assert_eq!(sent.len(), 2);
        let (ty, payload) = parse_request(&sent[1].1).unwrap();
        assert_eq!(ty, QueryType::Info as u8);
        assert_eq!(payload, &[INFO_PAYLOAD, &TOKEN[..]].concat()[..]);
    }

    #[test]
    fn test_server_info_timeout() {
        let connector = ScriptedConnector::default();

        let info = query(&connector).server_info();

        assert_eq!(info.app_id, -1);
        assert_eq!(info.bots, -1);
        assert_eq!(info.name, "N/A (request timed out)");
    }

    #[test]
    fn test_server_info_malformed() {
        let connector = ScriptedConnector::default();
        connector.reply(SocketKind::Single, single(&info_payload()[..10]));

        let mut q = query(&connector);
        assert!(!q.server_info().is_available());

        connector.reply(SocketKind::Single, single(&info_payload()[..10]));
        assert!(matches!(
            q.try_server_info(),
            Err(Error::UnexpectedEndOfBuffer { .. })
        ));
    }

    #[test]
    fn test_players() {
        let connector = ScriptedConnector::default();
        connector
            .reply(SocketKind::Single, challenge_reply())
            .reply(SocketKind::Single, single(&players_payload()));

        let players = query(&connector).players().unwrap();

        assert_eq!(
            players,
            vec![
                Player {
                    name: "alice".into(),
                    score: 10,
                    duration: 123.5,
                },
                Player {
                    name: "bob".into(),
                    score: -3,
                    duration: 0.0,
                },
            ]
        );

        let sent = connector.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            parse_request(&sent[0].1).unwrap(),
            (QueryType::Player as u8, &CHALLENGE_REQUEST[..])
        );
        assert_eq!(
            parse_request(&sent[1].1).unwrap(),
            (QueryType::Player as u8, &TOKEN[..])
        );
    }

    #[test]
    fn test_players_timeout() {
        let connector = ScriptedConnector::default();
        connector.reply(SocketKind::Single, challenge_reply());

        let result = query(&connector).players();
        assert!(matches!(result, Err(Error::TransportTimeout)));
    }

    #[test]
    fn test_players_without_challenge() {
        let connector = ScriptedConnector::default();
        connector
            .reply(SocketKind::Single, single(&players_payload()))
            .reply(SocketKind::Single, single(&players_payload()));

        let players = query(&connector).players().unwrap();
        let names: Vec<_> = players.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);

        // The bytes after the type byte are echoed back as the token.
        let sent = connector.sent();
        assert_eq!(
            parse_request(&sent[1].1).unwrap(),
            (QueryType::Player as u8, &[0x02, 0x00, 0x61, 0x6C][..])
        );
    }

    #[test]
    fn test_rules_single() {
        let connector = ScriptedConnector::default();
        connector
            .reply(SocketKind::Multi, challenge_reply())
            .reply(
                SocketKind::Multi,
                single(&rules_payload(&[("mp_timelimit", "30")])),
            );

        let rules = query(&connector).rules().unwrap();
        assert_eq!(
            rules,
            vec![Rule {
                name: "mp_timelimit".into(),
                value: "30".into(),
            }]
        );

        let sent = connector.sent();
        assert!(sent.iter().all(|(kind, _)| *kind == SocketKind::Multi));
        assert_eq!(
            parse_request(&sent[1].1).unwrap(),
            (QueryType::Rules as u8, &TOKEN[..])
        );
    }

    #[test]
    fn test_rules_unusual_marker() {
        let mut payload = rules_payload(&[("mp_timelimit", "30")]);
        payload[0] = 0x00;
        let connector = ScriptedConnector::default();
        connector
            .reply(SocketKind::Multi, challenge_reply())
            .reply(SocketKind::Multi, single(&payload));

        let rules = query(&connector).rules().unwrap();
        assert_eq!(
            rules,
            vec![Rule {
                name: "mp_timelimit".into(),
                value: "30".into(),
            }]
        );
    }

    fn split_rules() -> Vec<Vec<u8>> {
        let mut first = BytesMut::new();
        first.put_slice(&HEADER);
        first.put_u8(0x45);
        first.put_i16_le(3);
        cstr(&mut first, "mp_timelimit");
        cstr(&mut first, "30");

        let mut second = BytesMut::new();
        cstr(&mut second, "sv_gravity");
        cstr(&mut second, "800");

        let mut third = BytesMut::new();
        cstr(&mut third, "sv_cheats");
        cstr(&mut third, "0");

        vec![
            split_datagram(99, 3, 0, None, &first),
            split_datagram(99, 3, 1, None, &second),
            split_datagram(99, 3, 2, None, &third),
        ]
    }

    #[test]
    fn test_rules_split_out_of_order() {
        let fragments = split_rules();
        let connector = ScriptedConnector::default();
        connector.reply(SocketKind::Multi, challenge_reply());
        for i in [2, 0, 1] {
            connector.reply(SocketKind::Multi, fragments[i].clone());
        }

        let rules = query(&connector).rules().unwrap();
        let names: Vec<_> = rules.iter().map(|r| r.name.as_str()).collect();
        let values: Vec<_> = rules.iter().map(|r| r.value.as_str()).collect();

        assert_eq!(names, vec!["mp_timelimit", "sv_gravity", "sv_cheats"]);
        assert_eq!(values, vec!["30", "800", "0"]);
    }

    #[test]
    fn test_rules_split_aborted() {
        let fragments = split_rules();
        let connector = ScriptedConnector::default();
        connector
            .reply(SocketKind::Multi, challenge_reply())
            .reply(SocketKind::Multi, fragments[0].clone())
            .reply(SocketKind::Multi, single(&rules_payload(&[])));

        let result = query(&connector).rules();
        assert!(matches!(result, Err(Error::ReassemblyAborted(_))));
    }

    #[test]
    fn test_rules_split_short_datagram() {
        let fragments = split_rules();
        let connector = ScriptedConnector::default();
        connector
            .reply(SocketKind::Multi, challenge_reply())
            .reply(SocketKind::Multi, fragments[0].clone())
            .reply(SocketKind::Multi, vec![0xFE, 0xFF]);

        let result = query(&connector).rules();
        assert!(matches!(result, Err(Error::ReassemblyAborted(_))));
    }

    #[test]
    fn test_rules_split_truncated_header() {
        let fragments = split_rules();
        let connector = ScriptedConnector::default();
        connector
            .reply(SocketKind::Multi, challenge_reply())
            .reply(SocketKind::Multi, fragments[0].clone())
            .reply(SocketKind::Multi, vec![0xFE, 0xFF, 0xFF, 0xFF, 0x63, 0x00]);

        let result = query(&connector).rules();
        assert!(matches!(result, Err(Error::ReassemblyAborted(_))));
    }

    #[test]
    fn test_rules_compressed_oversized() {
        let mut fragments = compressed_rules(0);
        // Declared decompressed size sits right after the 12-byte split header.
        fragments[0][12..16].copy_from_slice(&(64u32 << 20).to_le_bytes());
        let connector = ScriptedConnector::default();
        connector.reply(SocketKind::Multi, challenge_reply());
        for fragment in fragments {
            connector.reply(SocketKind::Multi, fragment);
        }

        let result = query(&connector).rules();
        assert!(matches!(result, Err(Error::ReassemblyAborted(_))));
    }

    #[test]
    fn test_rules_split_timeout() {
        let fragments = split_rules();
        let connector = ScriptedConnector::default();
        connector
            .reply(SocketKind::Multi, challenge_reply())
            .reply(SocketKind::Multi, fragments[1].clone());

        assert!(query(&connector).rules().unwrap_err().is_timeout());
    }

    fn compressed_rules(crc_xor: u32) -> Vec<Vec<u8>> {
        let plain = single(&rules_payload(&[("sv_gravity", "800"), ("sv_cheats", "0")]));
        let packed = compress(&plain);
        let mid = packed.len() / 2;
        let id = 0x8000_0063;

        vec![
            split_datagram(
                id,
                2,
                0,
                Some((plain.len() as u32, checksum(&plain) ^ crc_xor)),
                &packed[..mid],
            ),
            split_datagram(id, 2, 1, None, &packed[mid..]),
        ]
    }

    #[test]
    fn test_rules_compressed() {
        let connector = ScriptedConnector::default();
        connector.reply(SocketKind::Multi, challenge_reply());
        for fragment in compressed_rules(0) {
            connector.reply(SocketKind::Multi, fragment);
        }

        let rules = query(&connector).rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].value, "800");
        assert_eq!(rules[1].name, "sv_cheats");
    }

    #[test]
    fn test_rules_checksum_mismatch() {
        let connector = ScriptedConnector::default();
        connector.reply(SocketKind::Multi, challenge_reply());
        for fragment in compressed_rules(0xFFFF) {
            connector.reply(SocketKind::Multi, fragment);
        }

        let e = query(&connector).rules().unwrap_err();
        assert!(matches!(e, Error::ChecksumMismatch { .. }));
        assert!(!e.is_timeout());
    }

    #[test]
    fn test_transport_lifecycle() {
        let connector = ScriptedConnector::default();
        let mut q = query(&connector);

        connector
            .reply(SocketKind::Single, single(&info_payload()))
            .reply(SocketKind::Single, single(&info_payload()));
        assert!(q.server_info().is_available());
        assert!(q.server_info().is_available());
        assert_eq!(connector.connects(), 1);

        // A failed call leaves the engine usable.
        assert!(q.players().is_err());
        connector.reply(SocketKind::Single, single(&info_payload()));
        assert!(q.server_info().is_available());
        assert_eq!(connector.connects(), 1);

        let other: SocketAddr = "127.0.0.1:27016".parse().unwrap();
        q.set_host(other);
        connector.reply(SocketKind::Single, single(&info_payload()));
        q.server_info();
        assert_eq!(connector.connects(), 2);
        assert_eq!(
            connector.0.lock().unwrap().connects[1],
            (other, SocketKind::Single)
        );

        q.cleanup();
        q.rules().unwrap_err();
        assert_eq!(connector.connects(), 3);
    }

    fn loopback(timeout: Duration) -> (UdpSocket, SourceQuery) {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut q = SourceQuery::new(server.local_addr().unwrap());
        q.set_config(QueryConfig {
            send_timeout: timeout,
            recv_timeout: timeout,
            ..Default::default()
        });
        (server, q)
    }

    #[test]
    fn test_udp_timeout() {
        let (_silent, mut q) = loopback(Duration::from_millis(100));

        let info = q.server_info();
        assert_eq!(info.app_id, -1);

        assert!(q.players().unwrap_err().is_timeout());
    }

    #[test]
    fn test_udp_server_info() {
        let (server, mut q) = loopback(Duration::from_secs(2));

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 1400];
            let (len, client) = server.recv_from(&mut buf).unwrap();
            let (ty, payload) = parse_request(&buf[..len]).unwrap();
            assert_eq!(ty, QueryType::Info as u8);
            assert_eq!(payload, INFO_PAYLOAD);
            server.send_to(&single(&info_payload()), client).unwrap();
        });

        let info = q.server_info();
        handle.join().unwrap();

        assert_eq!(info.name, "Test Server");
        assert_eq!(info.os, Os::Linux);
    }
}

//! Packet kinds the proxy understands and the registry that maps wire ids to them.

use crate::codec::{validate_record, FieldKind, Record};
use crate::error::{ProtocolError, ProtocolResult};
use crate::{schema_enum, schema_struct};
use bytes::BytesMut;
use std::collections::HashMap;
use uuid::Uuid;

/// Largest payload any frame may carry.
pub const MAX_FRAME_PAYLOAD: u32 = 0x6400_0000;

schema_enum! {
    pub enum ClientType { Game, Editor }
}

schema_enum! {
    pub enum DisconnectType { Disconnect, Crash }
}

schema_enum! {
    pub enum PongType { Raw, Direct, Tick }
}

schema_enum! {
    pub enum ServerMessageType { Chat, Notification }
}

schema_struct! {
    /// A host/port pair as carried inside packets.
    pub struct HostAddress {
        port: required i16 => FieldKind::I16,
        host: required String => FieldKind::String { max: 256, ascii: false },
    }
}

schema_struct! {
    /// First client message; carries the player's identity.
    pub struct Connect {
        protocol_hash: required String => FieldKind::FixedAscii(64),
        client_type: required ClientType => ClientType::kind(),
        uuid: required Uuid => FieldKind::Uuid,
        language: optional String => FieldKind::String { max: 128, ascii: true },
        identity_token: optional String => FieldKind::String { max: 8192, ascii: false },
        username: required String => FieldKind::String { max: 16, ascii: true },
        referral_data: optional Vec<u8> => FieldKind::Bytes { max: 4096 },
        referral_source: optional HostAddress => FieldKind::Struct(&<HostAddress as Record>::SCHEMA),
    }
}

schema_struct! {
    pub struct Disconnect {
        disconnect_type: required DisconnectType => DisconnectType::kind(),
        reason: optional String => FieldKind::String { max: 4_096_000, ascii: false },
    }
}

schema_struct! {
    pub struct Ping {
        id: required i32 => FieldKind::I32,
        time_secs: optional i64 => FieldKind::I64,
        time_nanos: optional i32 => FieldKind::I32,
        last_ping_raw: required i32 => FieldKind::I32,
        last_ping_direct: required i32 => FieldKind::I32,
        last_ping_tick: required i32 => FieldKind::I32,
    }
}

schema_struct! {
    pub struct Pong {
        id: required i32 => FieldKind::I32,
        time_secs: optional i64 => FieldKind::I64,
        time_nanos: optional i32 => FieldKind::I32,
        pong_type: required PongType => PongType::kind(),
        packet_queue_size: required i16 => FieldKind::I16,
    }
}

schema_struct! {
    pub struct Status {
        player_count: required i32 => FieldKind::I32,
        max_players: required i32 => FieldKind::I32,
        name: optional String => FieldKind::String { max: 128, ascii: false },
        motd: optional String => FieldKind::String { max: 512, ascii: false },
    }
}

schema_struct! {
    pub struct AuthGrant {
        authorization_grant: optional String => FieldKind::String { max: 4096, ascii: false },
        server_identity_token: optional String => FieldKind::String { max: 8192, ascii: false },
    }
}

schema_struct! {
    pub struct AuthToken {
        access_token: optional String => FieldKind::String { max: 8192, ascii: false },
        server_authorization_grant: optional String => FieldKind::String { max: 4096, ascii: false },
    }
}

schema_struct! {
    pub struct ServerAuthToken {
        server_access_token: optional String => FieldKind::String { max: 8192, ascii: false },
        password_challenge: optional Vec<u8> => FieldKind::Bytes { max: 64 },
    }
}

schema_struct! {
    pub struct ConnectAccept {
        password_challenge: optional Vec<u8> => FieldKind::Bytes { max: 64 },
    }
}

schema_struct! {
    pub struct PasswordResponse {
        hash: optional Vec<u8> => FieldKind::Bytes { max: 64 },
    }
}

schema_struct! {
    pub struct PasswordAccepted {}
}

schema_struct! {
    pub struct PasswordRejected {
        attempts_remaining: required i32 => FieldKind::I32,
        new_challenge: optional Vec<u8> => FieldKind::Bytes { max: 64 },
    }
}

schema_struct! {
    /// Tells the client to reconnect to `host_to`, presenting `data`.
    pub struct ClientReferral {
        host_to: optional HostAddress => FieldKind::Struct(&<HostAddress as Record>::SCHEMA),
        data: optional Vec<u8> => FieldKind::Bytes { max: 4096 },
    }
}

schema_struct! {
    pub struct ServerMessage {
        message_type: required ServerMessageType => ServerMessageType::kind(),
        message: optional String => FieldKind::String { max: 4_096_000, ascii: false },
    }
}

schema_struct! {
    pub struct ChatMessage {
        message: optional String => FieldKind::String { max: 4_096_000, ascii: false },
    }
}

/// A record type that travels as its own frame.
pub trait PacketType: Record + Into<Packet> {
    const ID: u32;
    const KIND: PacketKind;
    const MAX_SIZE: usize;

    fn from_packet(packet: &Packet) -> Option<&Self>;
}

macro_rules! packets {
    ($( $ty:ident = $id:literal, max $max:expr; )*) => {
        /// Discriminant of every known packet.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum PacketKind {
            $( $ty, )*
        }

        impl PacketKind {
            pub const ALL: &'static [PacketKind] = &[$( PacketKind::$ty, )*];

            pub fn id(self) -> u32 {
                match self {
                    $( PacketKind::$ty => $id, )*
                }
            }

            pub fn from_id(id: u32) -> Option<Self> {
                match id {
                    $( $id => Some(PacketKind::$ty), )*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( PacketKind::$ty => stringify!($ty), )*
                }
            }

            fn info(self) -> PacketInfo {
                match self {
                    $( PacketKind::$ty => PacketInfo::of::<$ty>(), )*
                }
            }
        }

        /// A decoded packet.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Packet {
            $( $ty($ty), )*
        }

        impl Packet {
            pub fn kind(&self) -> PacketKind {
                match self {
                    $( Packet::$ty(_) => PacketKind::$ty, )*
                }
            }
        }

        $(
            impl From<$ty> for Packet {
                fn from(p: $ty) -> Self {
                    Packet::$ty(p)
                }
            }

            impl PacketType for $ty {
                const ID: u32 = $id;
                const KIND: PacketKind = PacketKind::$ty;
                const MAX_SIZE: usize = $max;

                fn from_packet(packet: &Packet) -> Option<&Self> {
                    match packet {
                        Packet::$ty(p) => Some(p),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }
            }
        )*
    };
}

packets! {
    Connect = 0, max 38_161;
    Disconnect = 1, max 16_384_007;
    Ping = 2, max 29;
    Pong = 3, max 20;
    Status = 10, max 2_587;
    AuthGrant = 11, max 49_171;
    AuthToken = 12, max 49_171;
    ServerAuthToken = 13, max 32_851;
    ConnectAccept = 14, max 70;
    PasswordResponse = 15, max 70;
    PasswordAccepted = 16, max 0;
    PasswordRejected = 17, max 74;
    ClientReferral = 18, max 5_141;
    ServerMessage = 210, max MAX_FRAME_PAYLOAD as usize;
    ChatMessage = 211, max 16_384_006;
}

impl Packet {
    pub fn id(&self) -> u32 {
        self.kind().id()
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }
}

/// Registry entry for one packet id.
#[derive(Clone, Copy)]
pub struct PacketInfo {
    pub id: u32,
    pub kind: PacketKind,
    pub name: &'static str,
    pub fixed_block_size: usize,
    pub max_size: usize,
    pub decode: fn(&[u8]) -> ProtocolResult<Packet>,
    pub encode: fn(&Packet, &mut BytesMut) -> ProtocolResult<()>,
    pub validate: fn(&[u8]) -> ProtocolResult<usize>,
}

impl PacketInfo {
    pub fn of<P: PacketType>() -> Self {
        Self {
            id: P::ID,
            kind: P::KIND,
            name: P::SCHEMA.name,
            fixed_block_size: P::SCHEMA.fixed_block_size(),
            max_size: P::MAX_SIZE,
            decode: decode_as::<P>,
            encode: encode_as::<P>,
            validate: validate_as::<P>,
        }
    }
}

impl std::fmt::Debug for PacketInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("fixed_block_size", &self.fixed_block_size)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

fn decode_as<P: PacketType>(data: &[u8]) -> ProtocolResult<Packet> {
    let (packet, _) = P::decode(data)?;
    Ok(packet.into())
}

fn encode_as<P: PacketType>(packet: &Packet, buf: &mut BytesMut) -> ProtocolResult<()> {
    let inner = P::from_packet(packet).ok_or(ProtocolError::TypeMismatch {
        field: P::SCHEMA.name,
    })?;
    inner.encode(buf)
}

fn validate_as<P: PacketType>(data: &[u8]) -> ProtocolResult<usize> {
    validate_record(&P::SCHEMA, data)
}

/// Maps wire ids to packet codecs and size limits.
#[derive(Debug, Clone)]
pub struct PacketRegistry {
    by_id: HashMap<u32, PacketInfo>,
}

impl PacketRegistry {
    /// An empty registry. Every id is unknown until registered.
    pub fn empty() -> Self {
        Self {
            by_id: HashMap::new(),
        }
    }

    /// Registry with every packet kind this crate declares.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for kind in PacketKind::ALL {
            registry.register(kind.info());
        }
        registry
    }

    pub fn register(&mut self, info: PacketInfo) {
        self.by_id.insert(info.id, info);
    }

    pub fn lookup(&self, id: u32) -> Option<&PacketInfo> {
        self.by_id.get(&id)
    }

    pub fn max_size(&self, id: u32) -> Option<usize> {
        self.lookup(id).map(|info| info.max_size)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for PacketRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: Packet) -> Packet {
        let registry = PacketRegistry::standard();
        let info = registry.lookup(packet.id()).unwrap();
        let mut buf = BytesMut::new();
        (info.encode)(&packet, &mut buf).unwrap();
        assert!(buf.len() <= info.max_size);
        (info.validate)(&buf).unwrap();
        (info.decode)(&buf).unwrap()
    }

    #[test]
    fn fixed_block_sizes_match_wire_layout() {
        let expected = [
            (0, 82),
            (1, 2),
            (2, 29),
            (3, 20),
            (10, 9),
            (11, 1),
            (12, 1),
            (13, 1),
            (14, 1),
            (15, 1),
            (16, 0),
            (17, 5),
            (18, 1),
            (210, 2),
            (211, 1),
        ];
        let registry = PacketRegistry::standard();
        assert_eq!(registry.len(), expected.len());
        for (id, fixed) in expected {
            let info = registry.lookup(id).unwrap();
            assert_eq!(info.fixed_block_size, fixed, "packet {}", info.name);
        }
    }

    #[test]
    fn connect_variable_block_start() {
        assert_eq!(<Connect as Record>::SCHEMA.variable_block_start(), 102);
    }

    #[test]
    fn connect_round_trip_full() {
        let connect = Connect {
            protocol_hash: "a".repeat(64),
            client_type: ClientType::Editor,
            uuid: Uuid::new_v4(),
            language: Some("de-DE".into()),
            identity_token: Some("token".into()),
            username: "Steve".into(),
            referral_data: Some(b"HYPROXY:lobby".to_vec()),
            referral_source: Some(HostAddress {
                port: 5520,
                host: "proxy.example".into(),
            }),
        };
        assert_eq!(round_trip(connect.clone().into()), Packet::Connect(connect));
    }

    #[test]
    fn connect_round_trip_minimal() {
        let connect = Connect {
            username: "Alex".into(),
            ..Default::default()
        };
        assert_eq!(round_trip(connect.clone().into()), Packet::Connect(connect));
    }

    #[test]
    fn connect_null_bits_follow_optional_order() {
        let connect = Connect {
            username: "Alex".into(),
            identity_token: Some("t".into()),
            referral_source: Some(HostAddress::default()),
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        connect.encode(&mut buf).unwrap();
        assert_eq!(buf[0], 0b1010);
    }

    #[test]
    fn empty_packet_round_trip() {
        let packet = Packet::PasswordAccepted(PasswordAccepted {});
        let mut buf = BytesMut::new();
        (PasswordAccepted {}).encode(&mut buf).unwrap();
        assert!(buf.is_empty());
        assert_eq!(round_trip(packet.clone()), packet);
    }

    #[test]
    fn auth_packets_round_trip() {
        let grant = AuthGrant {
            authorization_grant: Some("grant".into()),
            server_identity_token: None,
        };
        assert_eq!(round_trip(grant.clone().into()), grant.into());

        let token = ServerAuthToken {
            server_access_token: Some("access".into()),
            password_challenge: Some(vec![7; 64]),
        };
        assert_eq!(round_trip(token.clone().into()), token.into());
    }

    #[test]
    fn password_challenge_over_limit() {
        let accept = ConnectAccept {
            password_challenge: Some(vec![0; 65]),
        };
        let mut buf = BytesMut::new();
        assert!(matches!(
            accept.encode(&mut buf),
            Err(ProtocolError::ArrayTooLong { len: 65, max: 64, .. })
        ));
    }

    #[test]
    fn kind_id_mapping() {
        for kind in PacketKind::ALL {
            assert_eq!(PacketKind::from_id(kind.id()), Some(*kind));
        }
        assert_eq!(PacketKind::from_id(4), None);
        assert_eq!(PacketKind::ChatMessage.id(), 211);
    }

    #[test]
    fn encode_with_wrong_info_fails() {
        let registry = PacketRegistry::standard();
        let info = registry.lookup(0).unwrap();
        let mut buf = BytesMut::new();
        let err = (info.encode)(&Packet::ChatMessage(ChatMessage::default()), &mut buf);
        assert!(matches!(err, Err(ProtocolError::TypeMismatch { .. })));
    }
}

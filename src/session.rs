use std::fmt::Debug;

use bendy::decoding::FromBencode;
use bendy::encoding::{AsString, SingleItemEncoder, ToBencode};

use crate::{InfoHash, UserState};

/// Opaque key/value store the host provides for session persistence.
pub trait SessionStore: Send + Debug {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&mut self, key: &str, value: Vec<u8>);
    fn delete(&mut self, key: &str);
    fn keys(&self, prefix: &str) -> Vec<String>;
}

pub fn state_key(info_hash: InfoHash) -> String {
    format!("session:torrent:{}:state", hex::encode(info_hash))
}

pub fn bitfield_key(info_hash: InfoHash) -> String {
    format!("session:torrent:{}:bitfield", hex::encode(info_hash))
}

pub fn partials_key(info_hash: InfoHash) -> String {
    format!("session:torrent:{}:partials", hex::encode(info_hash))
}

/// Received blocks of one unfinished piece, staged data included so the
/// download resumes without refetching them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialPieceSnapshot {
    pub index: u32,
    /// Block bitmap, same layout as a wire bitfield over the piece blocks.
    pub received: Vec<u8>,
    /// The full staging buffer; only ranges flagged in `received` are valid.
    pub data: Vec<u8>,
}

impl ToBencode for PartialPieceSnapshot {
    const MAX_DEPTH: usize = 2;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"data", AsString(&self.data))?;
            e.emit_pair(b"index", self.index)?;
            e.emit_pair(b"received", AsString(&self.received))
        })
    }
}

impl FromBencode for PartialPieceSnapshot {
    fn decode_bencode_object(
        object: bendy::decoding::Object,
    ) -> Result<Self, bendy::decoding::Error> {
        use bendy::decoding::{Error, ResultExt};

        let mut index = None;
        let mut received = None;
        let mut data = None;
        let mut dict = object.try_into_dictionary()?;
        while let Some((tag, value)) = dict.next_pair()? {
            match tag {
                b"data" => {
                    data = AsString::decode_bencode_object(value)
                        .context("data")
                        .map(|AsString(v)| Some(v))?;
                }
                b"index" => {
                    index = u32::decode_bencode_object(value).context("index").map(Some)?;
                }
                b"received" => {
                    received = AsString::decode_bencode_object(value)
                        .context("received")
                        .map(|AsString(v)| Some(v))?;
                }
                _ => {}
            }
        }
        Ok(Self {
            index: index.ok_or_else(|| Error::missing_field("index"))?,
            received: received.ok_or_else(|| Error::missing_field("received"))?,
            data: data.ok_or_else(|| Error::missing_field("data"))?,
        })
    }
}

/// Everything the engine persists for one torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentSnapshot {
    pub user_state: UserState,
    pub bitfield: Vec<u8>,
    pub partials: Vec<PartialPieceSnapshot>,
}

impl ToBencode for TorrentSnapshot {
    const MAX_DEPTH: usize = 4;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"bitfield", AsString(&self.bitfield))?;
            e.emit_pair(b"partials", self.partials.clone())?;
            let state: u8 = match self.user_state {
                UserState::Stopped => 0,
                UserState::Active => 1,
            };
            e.emit_pair(b"state", state)
        })
    }
}

impl FromBencode for TorrentSnapshot {
    fn decode_bencode_object(
        object: bendy::decoding::Object,
    ) -> Result<Self, bendy::decoding::Error> {
        use bendy::decoding::{Error, ResultExt};

        let mut bitfield = None;
        let mut partials = None;
        let mut state = None;
        let mut dict = object.try_into_dictionary()?;
        while let Some((tag, value)) = dict.next_pair()? {
            match tag {
                b"bitfield" => {
                    bitfield = AsString::decode_bencode_object(value)
                        .context("bitfield")
                        .map(|AsString(v)| Some(v))?;
                }
                b"partials" => {
                    partials = Vec::decode_bencode_object(value)
                        .context("partials")
                        .map(Some)?;
                }
                b"state" => {
                    state = u8::decode_bencode_object(value).context("state").map(Some)?;
                }
                _ => {}
            }
        }
        let user_state = match state.ok_or_else(|| Error::missing_field("state"))? {
            0 => UserState::Stopped,
            1 => UserState::Active,
            other => {
                return Err(Error::unexpected_token("state 0 or 1", other.to_string()));
            }
        };
        Ok(Self {
            user_state,
            bitfield: bitfield.ok_or_else(|| Error::missing_field("bitfield"))?,
            partials: partials.unwrap_or_default(),
        })
    }
}

impl TorrentSnapshot {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_bencode().expect("snapshot encoding is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Self::from_bencode(bytes).map_err(|e| anyhow::anyhow!("{e}"))
    }
}

/// The three session keys are stored independently so the hot one (the
/// bitfield) can be rewritten without dragging partial piece data along.
pub fn encode_partials(partials: Vec<PartialPieceSnapshot>) -> Vec<u8> {
    partials.to_bencode().expect("snapshot encoding is infallible")
}

pub fn decode_partials(bytes: &[u8]) -> anyhow::Result<Vec<PartialPieceSnapshot>> {
    Vec::from_bencode(bytes).map_err(|e| anyhow::anyhow!("{e}"))
}

pub fn encode_user_state(state: UserState) -> Vec<u8> {
    match state {
        UserState::Stopped => vec![0],
        UserState::Active => vec![1],
    }
}

pub fn decode_user_state(bytes: &[u8]) -> anyhow::Result<UserState> {
    match bytes {
        [0] => Ok(UserState::Stopped),
        [1] => Ok(UserState::Active),
        other => anyhow::bail!("unknown user state encoding: {other:?}"),
    }
}

//! Encoding of the protocol messages the simulator may inspect.
//!
//! All integers are big-endian. A payload must be consumed exactly: trailing bytes are an
//! error.

use crate::{Error, NodeId, Period, Round, Step, Tag, PROPOSE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest as _, Sha256};

/// Length of a [Digest].
pub const DIGEST_LENGTH: usize = 32;

/// SHA-256 digest.
pub type Digest = [u8; DIGEST_LENGTH];

/// Hash a message by its kind and content.
///
/// Two messages with the same tag and payload have the same digest regardless of who sent them.
pub fn digest(tag: Tag, payload: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_str().as_bytes());
    hasher.update(payload);
    hasher.finalize().into()
}

/// A vote cast by `voter` for `value` at `(round, period, step)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Vote {
    pub round: Round,
    pub period: Period,
    pub step: Step,
    pub voter: NodeId,
    pub value: Digest,
}

impl Vote {
    const SIZE: usize = 8 + 8 + 1 + 4 + DIGEST_LENGTH;

    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.round);
        buf.put_u64(self.period);
        buf.put_u8(self.step);
        buf.put_u32(self.voter);
        buf.put_slice(&self.value);
    }

    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        let round = read_u64(buf)?;
        let period = read_u64(buf)?;
        let step = read_u8(buf)?;
        if step == PROPOSE {
            return Err(Error::InvalidStep(step));
        }
        let voter = read_u32(buf)?;
        let value = read_digest(buf)?;
        Ok(Self {
            round,
            period,
            step,
            voter,
            value,
        })
    }
}

/// A value proposed by `proposer` for `(round, period)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Proposal {
    pub round: Round,
    pub period: Period,
    pub proposer: NodeId,
    pub value: Bytes,
}

impl Proposal {
    /// Digest voters refer to when voting for this proposal.
    pub fn digest(&self) -> Digest {
        Sha256::digest(&self.value).into()
    }

    fn size(&self) -> usize {
        8 + 8 + 4 + 4 + self.value.len()
    }

    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.round);
        buf.put_u64(self.period);
        buf.put_u32(self.proposer);
        buf.put_u32(self.value.len() as u32);
        buf.put_slice(&self.value);
    }

    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        let round = read_u64(buf)?;
        let period = read_u64(buf)?;
        let proposer = read_u32(buf)?;
        let len = read_u32(buf)? as usize;
        if buf.remaining() < len {
            return Err(Error::EndOfBuffer);
        }
        let value = buf.copy_to_bytes(len);
        Ok(Self {
            round,
            period,
            proposer,
            value,
        })
    }
}

/// Certificate, assembled by `certifier`, that `voters` cert-voted for `value` in
/// `(round, period)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Bundle {
    pub round: Round,
    pub period: Period,
    pub certifier: NodeId,
    pub value: Digest,
    pub voters: Vec<NodeId>,
}

impl Bundle {
    fn size(&self) -> usize {
        8 + 8 + 4 + DIGEST_LENGTH + 4 + 4 * self.voters.len()
    }

    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.round);
        buf.put_u64(self.period);
        buf.put_u32(self.certifier);
        buf.put_slice(&self.value);
        buf.put_u32(self.voters.len() as u32);
        for voter in &self.voters {
            buf.put_u32(*voter);
        }
    }

    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        let round = read_u64(buf)?;
        let period = read_u64(buf)?;
        let certifier = read_u32(buf)?;
        let value = read_digest(buf)?;
        let count = read_u32(buf)? as usize;
        if buf.remaining() < count * 4 {
            return Err(Error::EndOfBuffer);
        }
        let voters = (0..count).map(|_| buf.get_u32()).collect();
        Ok(Self {
            round,
            period,
            certifier,
            value,
            voters,
        })
    }
}

/// Any message the simulator knows how to decode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Wire {
    Vote(Vote),
    Proposal(Proposal),
    Bundle(Bundle),
}

impl Wire {
    /// Tag the message is sent under.
    pub fn tag(&self) -> Tag {
        match self {
            Self::Vote(_) => Tag::Vote,
            Self::Proposal(_) => Tag::Proposal,
            Self::Bundle(_) => Tag::Bundle,
        }
    }

    /// Encode the message.
    pub fn encode(&self) -> Bytes {
        let size = match self {
            Self::Vote(_) => Vote::SIZE,
            Self::Proposal(proposal) => proposal.size(),
            Self::Bundle(bundle) => bundle.size(),
        };
        let mut buf = BytesMut::with_capacity(size);
        match self {
            Self::Vote(vote) => vote.write(&mut buf),
            Self::Proposal(proposal) => proposal.write(&mut buf),
            Self::Bundle(bundle) => bundle.write(&mut buf),
        }
        buf.freeze()
    }

    /// Decode a payload sent under `tag`.
    pub fn decode(tag: Tag, mut payload: &[u8]) -> Result<Self, Error> {
        let wire = match tag {
            Tag::Vote => Self::Vote(Vote::read(&mut payload)?),
            Tag::Proposal => Self::Proposal(Proposal::read(&mut payload)?),
            Tag::Bundle => Self::Bundle(Bundle::read(&mut payload)?),
        };
        if payload.has_remaining() {
            return Err(Error::ExtraData(payload.remaining()));
        }
        Ok(wire)
    }

    /// Decode a payload that must be a vote.
    pub fn decode_vote(tag: Tag, payload: &[u8]) -> Result<Vote, Error> {
        match Self::decode(tag, payload)? {
            Self::Vote(vote) => Ok(vote),
            other => Err(Error::UnexpectedTag(other.tag())),
        }
    }
}

impl From<Vote> for Wire {
    fn from(vote: Vote) -> Self {
        Self::Vote(vote)
    }
}

impl From<Proposal> for Wire {
    fn from(proposal: Proposal) -> Self {
        Self::Proposal(proposal)
    }
}

impl From<Bundle> for Wire {
    fn from(bundle: Bundle) -> Self {
        Self::Bundle(bundle)
    }
}

fn read_u8(buf: &mut impl Buf) -> Result<u8, Error> {
    if buf.remaining() < 1 {
        return Err(Error::EndOfBuffer);
    }
    Ok(buf.get_u8())
}

fn read_u32(buf: &mut impl Buf) -> Result<u32, Error> {
    if buf.remaining() < 4 {
        return Err(Error::EndOfBuffer);
    }
    Ok(buf.get_u32())
}

fn read_u64(buf: &mut impl Buf) -> Result<u64, Error> {
    if buf.remaining() < 8 {
        return Err(Error::EndOfBuffer);
    }
    Ok(buf.get_u64())
}

fn read_digest(buf: &mut impl Buf) -> Result<Digest, Error> {
    if buf.remaining() < DIGEST_LENGTH {
        return Err(Error::EndOfBuffer);
    }
    let mut digest = [0u8; DIGEST_LENGTH];
    buf.copy_to_slice(&mut digest);
    Ok(digest)
}

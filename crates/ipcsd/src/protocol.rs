// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! Discovery wire protocol.
//!
//! Five fixed-shape messages, each a flat byte sequence with a one-byte tag
//! at offset 0 followed by the plain-old-data fields in declaration order
//! (platform-native byte order; broker and clients are co-located on one
//! host):
//!
//! ```text
//! +--------+----------------------+---------------+
//! | tag 1B | identifier 4 x u32   | address 2xu32 |   OfferService / StopOfferService
//! +--------+----------------------+---------------+
//! | tag 1B | identifier 4 x u32   |                   ListenService / StopListenService
//! +--------+----------------------+
//! | tag 1B | version u32 | binding u8 |               Init
//! +--------+-------------+-----------+
//! ```
//!
//! Decoding requires the buffer length to equal the declared size for the
//! tag; a length mismatch, an unknown tag, or a wildcard identifier in an
//! offer message all yield [`DiscoveryError::MessageCorrupted`].

use crate::error::DiscoveryError;
use crate::instance::{ProvidedInstance, RequiredInstance, ServiceInstanceId};
use crate::transport::{BindingType, UnicastAddress};

/// Encoded size of an `Init` message.
pub const INIT_SIZE: usize = 6;
/// Encoded size of an `OfferService` / `StopOfferService` message.
pub const OFFER_SERVICE_SIZE: usize = 25;
/// Encoded size of a `ListenService` / `StopListenService` message.
pub const LISTEN_SERVICE_SIZE: usize = 17;

/// One-byte message tag at offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Init = 0,
    OfferService = 1,
    ListenService = 2,
    StopListenService = 3,
    StopOfferService = 4,
}

impl MessageId {
    fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(MessageId::Init),
            1 => Some(MessageId::OfferService),
            2 => Some(MessageId::ListenService),
            3 => Some(MessageId::StopListenService),
            4 => Some(MessageId::StopOfferService),
            _ => None,
        }
    }
}

/// Client registration, first message on every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitMessage {
    pub protocol_version: u32,
    pub binding_type: BindingType,
}

/// A service instance became available at the given endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferServiceMessage {
    pub instance: ProvidedInstance,
    pub address: UnicastAddress,
}

/// A service instance is no longer available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOfferServiceMessage {
    pub instance: ProvidedInstance,
    pub address: UnicastAddress,
}

/// Subscription to all instances matching the (possibly wildcarded)
/// identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenServiceMessage {
    pub instance: RequiredInstance,
}

/// Subscription withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopListenServiceMessage {
    pub instance: RequiredInstance,
}

/// Tagged sum over all message variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    Init(InitMessage),
    OfferService(OfferServiceMessage),
    ListenService(ListenServiceMessage),
    StopListenService(StopListenServiceMessage),
    StopOfferService(StopOfferServiceMessage),
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(raw)
}

fn put_instance(buf: &mut [u8], offset: usize, id: &ServiceInstanceId) {
    put_u32(buf, offset, id.service_id);
    put_u32(buf, offset + 4, id.instance_id);
    put_u32(buf, offset + 8, id.major_version);
    put_u32(buf, offset + 12, id.minor_version);
}

fn get_instance(buf: &[u8], offset: usize) -> ServiceInstanceId {
    ServiceInstanceId::new(
        get_u32(buf, offset),
        get_u32(buf, offset + 4),
        get_u32(buf, offset + 8),
        get_u32(buf, offset + 12),
    )
}

impl InitMessage {
    pub fn new(binding_type: BindingType) -> Self {
        Self {
            protocol_version: crate::config::PROTOCOL_VERSION,
            binding_type,
        }
    }

    pub fn encode(&self) -> [u8; INIT_SIZE] {
        let mut buf = [0u8; INIT_SIZE];
        buf[0] = MessageId::Init as u8;
        put_u32(&mut buf, 1, self.protocol_version);
        buf[5] = self.binding_type.to_wire();
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, DiscoveryError> {
        if buf.len() != INIT_SIZE {
            return Err(DiscoveryError::MessageCorrupted);
        }
        let binding_type =
            BindingType::from_wire(buf[5]).ok_or(DiscoveryError::MessageCorrupted)?;
        Ok(Self {
            protocol_version: get_u32(buf, 1),
            binding_type,
        })
    }
}

impl OfferServiceMessage {
    pub fn new(instance: ProvidedInstance, address: UnicastAddress) -> Self {
        Self { instance, address }
    }

    pub fn encode(&self) -> [u8; OFFER_SERVICE_SIZE] {
        encode_offer(MessageId::OfferService, &self.instance, &self.address)
    }

    fn decode(buf: &[u8]) -> Result<Self, DiscoveryError> {
        let (instance, address) = decode_offer(buf)?;
        Ok(Self { instance, address })
    }
}

impl StopOfferServiceMessage {
    pub fn new(instance: ProvidedInstance, address: UnicastAddress) -> Self {
        Self { instance, address }
    }

    pub fn encode(&self) -> [u8; OFFER_SERVICE_SIZE] {
        encode_offer(MessageId::StopOfferService, &self.instance, &self.address)
    }

    fn decode(buf: &[u8]) -> Result<Self, DiscoveryError> {
        let (instance, address) = decode_offer(buf)?;
        Ok(Self { instance, address })
    }
}

fn encode_offer(
    id: MessageId,
    instance: &ProvidedInstance,
    address: &UnicastAddress,
) -> [u8; OFFER_SERVICE_SIZE] {
    let mut buf = [0u8; OFFER_SERVICE_SIZE];
    buf[0] = id as u8;
    put_instance(&mut buf, 1, instance.id());
    put_u32(&mut buf, 17, address.domain);
    put_u32(&mut buf, 21, address.port);
    buf
}

fn decode_offer(buf: &[u8]) -> Result<(ProvidedInstance, UnicastAddress), DiscoveryError> {
    if buf.len() != OFFER_SERVICE_SIZE {
        return Err(DiscoveryError::MessageCorrupted);
    }
    // A wildcard identifier cannot name a concrete offered instance.
    let instance =
        ProvidedInstance::try_new(get_instance(buf, 1)).ok_or(DiscoveryError::MessageCorrupted)?;
    let address = UnicastAddress::new(get_u32(buf, 17), get_u32(buf, 21));
    Ok((instance, address))
}

impl ListenServiceMessage {
    pub fn new(instance: RequiredInstance) -> Self {
        Self { instance }
    }

    pub fn encode(&self) -> [u8; LISTEN_SERVICE_SIZE] {
        encode_listen(MessageId::ListenService, &self.instance)
    }

    fn decode(buf: &[u8]) -> Result<Self, DiscoveryError> {
        Ok(Self {
            instance: decode_listen(buf)?,
        })
    }
}

impl StopListenServiceMessage {
    pub fn new(instance: RequiredInstance) -> Self {
        Self { instance }
    }

    pub fn encode(&self) -> [u8; LISTEN_SERVICE_SIZE] {
        encode_listen(MessageId::StopListenService, &self.instance)
    }

    fn decode(buf: &[u8]) -> Result<Self, DiscoveryError> {
        Ok(Self {
            instance: decode_listen(buf)?,
        })
    }
}

fn encode_listen(id: MessageId, instance: &RequiredInstance) -> [u8; LISTEN_SERVICE_SIZE] {
    let mut buf = [0u8; LISTEN_SERVICE_SIZE];
    buf[0] = id as u8;
    put_instance(&mut buf, 1, instance.id());
    buf
}

fn decode_listen(buf: &[u8]) -> Result<RequiredInstance, DiscoveryError> {
    if buf.len() != LISTEN_SERVICE_SIZE {
        return Err(DiscoveryError::MessageCorrupted);
    }
    Ok(RequiredInstance::from(get_instance(buf, 1)))
}

impl Message {
    /// Decode one received message.
    ///
    /// The buffer must contain exactly one message; the framing layer
    /// guarantees this for transport reads.
    pub fn decode(buf: &[u8]) -> Result<Message, DiscoveryError> {
        let tag = *buf.first().ok_or(DiscoveryError::MessageCorrupted)?;
        // Unknown tags mean the message id is out of bounds.
        let id = MessageId::from_wire(tag).ok_or(DiscoveryError::MessageCorrupted)?;
        match id {
            MessageId::Init => InitMessage::decode(buf).map(Message::Init),
            MessageId::OfferService => OfferServiceMessage::decode(buf).map(Message::OfferService),
            MessageId::ListenService => {
                ListenServiceMessage::decode(buf).map(Message::ListenService)
            }
            MessageId::StopListenService => {
                StopListenServiceMessage::decode(buf).map(Message::StopListenService)
            }
            MessageId::StopOfferService => {
                StopOfferServiceMessage::decode(buf).map(Message::StopOfferService)
            }
        }
    }

    pub fn id(&self) -> MessageId {
        match self {
            Message::Init(_) => MessageId::Init,
            Message::OfferService(_) => MessageId::OfferService,
            Message::ListenService(_) => MessageId::ListenService,
            Message::StopListenService(_) => MessageId::StopListenService,
            Message::StopOfferService(_) => MessageId::StopOfferService,
        }
    }
}

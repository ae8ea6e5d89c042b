//! The slice of the Meshtastic client API envelope the connection layer needs.
//!
//! Only the outer `ToRadio`/`FromRadio` oneofs are declared. Nested payloads
//! (configuration, channels, node records, mesh packets) are length-delimited on the
//! wire and are kept here as opaque byte strings, which decodes identically to the
//! full schema without depending on it. Unknown fields are skipped by prost.

/// Client to device.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ToRadio {
    #[prost(oneof = "to_radio::PayloadVariant", tags = "1, 3, 4, 7")]
    pub payload_variant: ::core::option::Option<to_radio::PayloadVariant>,
}

pub mod to_radio {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        /// Encoded mesh packet, opaque to this crate.
        #[prost(bytes = "vec", tag = "1")]
        Packet(::prost::alloc::vec::Vec<u8>),
        /// Ask the device to stream its configuration, ending with `config_complete_id`.
        #[prost(uint32, tag = "3")]
        WantConfigId(u32),
        /// Tell the device this client is going away.
        #[prost(bool, tag = "4")]
        Disconnect(bool),
        #[prost(message, tag = "7")]
        Heartbeat(super::Heartbeat),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Heartbeat {
    #[prost(uint32, tag = "1")]
    pub nonce: u32,
}

/// Device to client.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FromRadio {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(
        oneof = "from_radio::PayloadVariant",
        tags = "2, 3, 4, 5, 6, 7, 8, 9, 10, 13, 16"
    )]
    pub payload_variant: ::core::option::Option<from_radio::PayloadVariant>,
}

pub mod from_radio {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(bytes = "vec", tag = "2")]
        Packet(::prost::alloc::vec::Vec<u8>),
        #[prost(message, tag = "3")]
        MyInfo(super::MyNodeInfo),
        #[prost(bytes = "vec", tag = "4")]
        NodeInfo(::prost::alloc::vec::Vec<u8>),
        #[prost(bytes = "vec", tag = "5")]
        Config(::prost::alloc::vec::Vec<u8>),
        #[prost(bytes = "vec", tag = "6")]
        LogRecord(::prost::alloc::vec::Vec<u8>),
        /// Echo of the `want_config_id` whose stream has finished.
        #[prost(uint32, tag = "7")]
        ConfigCompleteId(u32),
        #[prost(bool, tag = "8")]
        Rebooted(bool),
        #[prost(bytes = "vec", tag = "9")]
        ModuleConfig(::prost::alloc::vec::Vec<u8>),
        #[prost(bytes = "vec", tag = "10")]
        Channel(::prost::alloc::vec::Vec<u8>),
        #[prost(bytes = "vec", tag = "13")]
        Metadata(::prost::alloc::vec::Vec<u8>),
        #[prost(bytes = "vec", tag = "16")]
        ClientNotification(::prost::alloc::vec::Vec<u8>),
    }
}

/// Identity of the locally attached node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MyNodeInfo {
    #[prost(uint32, tag = "1")]
    pub my_node_num: u32,
}

impl ToRadio {
    pub fn want_config(id: u32) -> Self {
        Self {
            payload_variant: Some(to_radio::PayloadVariant::WantConfigId(id)),
        }
    }

    pub fn heartbeat(nonce: u32) -> Self {
        Self {
            payload_variant: Some(to_radio::PayloadVariant::Heartbeat(Heartbeat { nonce })),
        }
    }

    pub fn disconnect() -> Self {
        Self {
            payload_variant: Some(to_radio::PayloadVariant::Disconnect(true)),
        }
    }

    pub fn packet(encoded: Vec<u8>) -> Self {
        Self {
            payload_variant: Some(to_radio::PayloadVariant::Packet(encoded)),
        }
    }
}

impl FromRadio {
    pub fn with(variant: from_radio::PayloadVariant) -> Self {
        Self {
            id: 0,
            payload_variant: Some(variant),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn want_config_wire_bytes() {
        // field 3, varint: 0x18 then 69420 as LEB128
        let encoded = ToRadio::want_config(69420).encode_to_vec();
        assert_eq!(encoded, vec![0x18, 0xac, 0x9e, 0x04]);
    }

    #[test]
    fn nested_config_decodes_as_opaque_bytes() {
        // FromRadio { config (5): <nested message bytes 08 01> }
        let wire = [0x2a, 0x02, 0x08, 0x01];
        let msg = FromRadio::decode(&wire[..]).unwrap();
        assert_eq!(
            msg.payload_variant,
            Some(from_radio::PayloadVariant::Config(vec![0x08, 0x01]))
        );
    }

    #[test]
    fn unknown_variants_are_skipped() {
        // FromRadio { id: 5, queueStatus (11): <bytes> }
        let wire = [0x08, 0x05, 0x5a, 0x02, 0x08, 0x10];
        let msg = FromRadio::decode(&wire[..]).unwrap();
        assert_eq!(msg.id, 5);
        assert!(msg.payload_variant.is_none());
    }
}

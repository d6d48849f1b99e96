//! Generated bindings for the minimal protobuf subset in `proto/mesh.proto`,
//! compiled by `build.rs`. Only the messages and fields the core actually
//! consumes are modeled — see the module doc on `radio` for why this is
//! intentionally a subset rather than a full schema port.

include!(concat!(env!("OUT_DIR"), "/meshtastic.rs"));

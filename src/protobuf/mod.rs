//! Generated protobuf modules
//!
//! `build.rs` compiles `protos/meshtastic/*.proto`; prost emits one file per
//! package (`meshtastic.rs`). The wrapper silences lints for the parts of the
//! generated API this crate never touches.

pub mod meshtastic_generated {
    //! Generated Meshtastic protobuf types (MQTT uplink subset).
    #[allow(dead_code, unused_imports, unused_variables, unused_mut, unused_macros)]
    #[allow(clippy::all)]
    // Generated docs can contain tag-like text; relax strict rustdoc HTML checks here
    #[allow(rustdoc::invalid_html_tags)]
    mod inner {
        include!(concat!(env!("OUT_DIR"), "/meshtastic.rs"));
    }
    pub use inner::*;
}

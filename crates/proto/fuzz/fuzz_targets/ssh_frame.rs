//! Fuzz target for the frame decoder and message parsers.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_frame -- -max_total_time=300
//! ```

#![no_main]
use bytes::BytesMut;
use keel_proto::ssh::auth::{AuthBanner, AuthFailure};
use keel_proto::ssh::codec::OpeningKeys;
use keel_proto::ssh::connection::{ChannelOpenConfirmation, ChannelRequest};
use keel_proto::ssh::kex::KexInit;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut opening = OpeningKeys::plaintext();
    let mut buf = BytesMut::from(data);

    // Arbitrary bytes never panic; each decoded payload goes through the
    // parsers the client applies to server messages.
    while let Ok(Some(payload)) = opening.decode_frame(&mut buf) {
        let _ = KexInit::from_bytes(&payload);
        let _ = AuthFailure::from_bytes(&payload);
        let _ = AuthBanner::from_bytes(&payload);
        let _ = ChannelOpenConfirmation::from_bytes(&payload);
        let _ = ChannelRequest::from_bytes(&payload);
    }
});

//! Device session client built on the MULTITRANS framer.
//!
//! One [`DeviceClient`] per physical connection, and one role per connection:
//! a preview (device → client media) or a talk (client → device audio)
//! session. A caller needing both dials twice.
//!
//! ```text
//! 1. DeviceClient::dial(address, timeout)
//! 2. client.handshake(username, password)
//! 3. client.start_preview()  | client.start_talk()
//! 4. client.read() loop      | client.write_talk(alaw) loop
//! 5. client.stop(session_id)
//! 6. client.close()
//! ```

pub mod client;
pub mod error;
pub mod messages;
pub mod rtp;

pub use client::DeviceClient;
pub use error::DeviceError;
pub use messages::PreviewSession;
pub use rtp::TalkPacketizer;

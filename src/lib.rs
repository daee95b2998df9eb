//! UDP rendezvous for peer-to-peer applications.
//!
//! A lightweight central [server](server::Server) introduces freshly started
//!  [peers](peer::Peer) to a rotating set of recently seen participants. After the
//!  introductions the peers talk directly, multiplexing application traffic over the
//!  same UDP socket they used for rendezvous. The server forwards no user traffic and
//!  holds no long-term state about who is connected.

pub mod message;
pub mod mingle_set;
pub mod nat;
pub mod peer;
pub mod server;
pub mod util;

// author: kodeholic (powered by Claude)

pub mod datachannel;
pub mod dtls;
pub mod ice;
pub mod port;
pub mod sctp;
pub mod srtp;
pub mod state;

pub use datachannel::{DataChannelCreated, DataChannelEvent, DataChannelEventHandler, DataChannelMessage};
pub use dtls::{CertPair, DtlsContext, DtlsEvent, DtlsFactory, DtlsSession, DtlsTransport};
pub use ice::{IceConnectionState, IceNotifier};
pub use port::{classify, PacketKind, Port, PortRegistry};
pub use sctp::{Association, AssociationEvent, AssociationFactory, SctpAssociation, SctpPacket, UserMessage};
pub use srtp::{SrtpContext, SrtpContextKey, SrtpContextRegistry, SrtpKeys};
pub use state::{BufferTransportGenerator, SessionArgs, SessionState};

//! Header schemas.
//!
//! Each message kind declares its header section as an enum of known tokens.
//! The declaration order is the encode order. Identifiers, types and the
//! required flag are part of the wire contract.

use crate::token::TokenType;
use std::fmt::Debug;
use std::hash::Hash;

/// A header schema: the set of tokens a message kind declares
pub trait Header: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// All declared tokens in encode order
    const ALL: &'static [Self];

    /// Wire identifier
    fn id(self) -> u16;

    /// Name used in logs and mapped headers
    fn name(self) -> &'static str;

    /// Declared payload type
    fn token_type(self) -> TokenType;

    /// Whether a well-formed stream must carry this token
    fn is_required(self) -> bool;

    /// Look up a declared token by wire identifier
    fn from_id(id: u16) -> Option<Self>;

    /// Position in [`Header::ALL`]
    fn index(self) -> usize;
}

macro_rules! define_headers {
    (
        $(#[$enum_meta:meta])*
        pub enum $name:ident {
            $(
                $(#[$meta:meta])*
                $variant:ident = $id:literal, $ty:ident, $required:literal;
            )*
        }
    ) => {
        $(#[$enum_meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$meta])* $variant, )*
        }

        impl Header for $name {
            const ALL: &'static [Self] = &[ $( Self::$variant, )* ];

            fn id(self) -> u16 {
                match self {
                    $( Self::$variant => $id, )*
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => stringify!($variant), )*
                }
            }

            fn token_type(self) -> TokenType {
                match self {
                    $( Self::$variant => TokenType::$ty, )*
                }
            }

            fn is_required(self) -> bool {
                match self {
                    $( Self::$variant => $required, )*
                }
            }

            fn from_id(id: u16) -> Option<Self> {
                match id {
                    $( $id => Some(Self::$variant), )*
                    _ => None,
                }
            }

            fn index(self) -> usize {
                self as usize
            }
        }
    };
}

define_headers! {
    /// Headers of the context request sent once per connection
    pub enum ContextRequestHeader {
        /// Protocol version the client speaks
        ProtocolVersion = 0x0000, ULong, true;
        /// Client library version
        ClientVersion = 0x0001, SmallString, true;
        /// Client user agent
        UserAgent = 0x0002, SmallString, true;
        /// Pre-computed credential, when the caller supplies one
        AuthorizationToken = 0x0003, String, false;
    }
}

define_headers! {
    /// Headers of the context response that completes negotiation
    pub enum ContextHeader {
        /// Protocol version the server accepted
        ProtocolVersion = 0x0000, ULong, false;
        /// Client version echoed back
        ClientVersion = 0x0001, SmallString, false;
        /// Server agent string; mandatory when the status is a success
        ServerAgent = 0x0002, SmallString, false;
        /// Server version string; mandatory when the status is a success
        ServerVersion = 0x0003, SmallString, false;
        /// Idle connection timeout advertised by the server
        IdleTimeoutInSeconds = 0x0004, ULong, false;
        /// Timeout for connections that never authenticate
        UnauthenticatedTimeoutInSeconds = 0x0005, ULong, false;
    }
}

define_headers! {
    /// Headers of a data-plane request
    pub enum RequestHeader {
        /// Resource identifier
        ResourceId = 0x0000, Bytes, false;
        /// Authorization token
        AuthorizationToken = 0x0001, String, false;
        /// Whether a payload section follows the frame
        PayloadPresent = 0x0002, Byte, true;
        /// Request date
        Date = 0x0003, SmallString, false;
        /// Feed page size
        PageSize = 0x0004, ULong, false;
        /// Session token
        SessionToken = 0x0005, String, false;
        /// Continuation token
        ContinuationToken = 0x0006, String, false;
        /// Indexing directive
        IndexingDirective = 0x0007, Byte, false;
        /// Conditional match (etag)
        Match = 0x0008, String, false;
        /// Collection partition index
        CollectionPartitionIndex = 0x000C, ULong, false;
        /// Collection service index
        CollectionServiceIndex = 0x000D, ULong, false;
        /// Consistency level
        ConsistencyLevel = 0x0010, Byte, false;
        /// Entity identifier
        EntityId = 0x0011, String, false;
        /// Replica path
        ReplicaPath = 0x0013, String, false;
        /// Database name for name-based addressing
        DatabaseName = 0x0015, String, false;
        /// Collection name for name-based addressing
        CollectionName = 0x0016, String, false;
        /// Document name for name-based addressing
        DocumentName = 0x0017, String, false;
        /// Partition key
        PartitionKey = 0x0021, String, false;
        /// Partition key range identifier
        PartitionKeyRangeId = 0x0022, String, false;
        /// Client retry attempt count
        ClientRetryAttemptCount = 0x0040, ULong, false;
        /// Remaining client-side time budget in milliseconds
        RemainingTimeInMsOnClientRequest = 0x0041, ULong, false;
        /// Transport request identifier
        TransportRequestId = 0x004D, ULong, false;
        /// Effective partition key
        EffectivePartitionKey = 0x005A, Bytes, false;
    }
}

define_headers! {
    /// Headers of a data-plane response
    pub enum ResponseHeader {
        /// Whether a payload section follows the frame
        PayloadPresent = 0x0000, Byte, true;
        /// Last state change timestamp
        LastStateChangeDateTime = 0x0002, SmallString, false;
        /// Continuation token
        ContinuationToken = 0x0003, String, false;
        /// Entity tag
        ETag = 0x0004, String, false;
        /// Suggested retry delay
        RetryAfterMilliseconds = 0x000C, ULong, false;
        /// Collection partition index
        CollectionPartitionIndex = 0x0011, ULong, false;
        /// Collection service index
        CollectionServiceIndex = 0x0012, ULong, false;
        /// Log sequence number
        Lsn = 0x0013, LongLong, false;
        /// Item count in a feed page
        ItemCount = 0x0014, ULong, false;
        /// Request charge
        RequestCharge = 0x0015, Double, false;
        /// Owner full name
        OwnerFullName = 0x0017, String, false;
        /// Owner identifier
        OwnerId = 0x0018, SmallString, false;
        /// Quorum-acknowledged LSN
        QuorumAckedLsn = 0x001A, LongLong, false;
        /// Backend sub-status code
        SubStatus = 0x001C, ULong, false;
        /// Current write quorum
        CurrentWriteQuorum = 0x001E, ULong, false;
        /// Current replica set size
        CurrentReplicaSetSize = 0x001F, ULong, false;
        /// Partition key range identifier
        PartitionKeyRangeId = 0x0021, String, false;
        /// Replica role
        XpRole = 0x0026, ULong, false;
        /// Global committed LSN
        GlobalCommittedLsn = 0x0029, LongLong, false;
        /// Item LSN
        ItemLsn = 0x0032, LongLong, false;
        /// Transport request identifier
        TransportRequestId = 0x0035, ULong, false;
        /// Server timestamp
        ServerDateTimeUtc = 0x0039, SmallString, false;
        /// Local LSN
        LocalLsn = 0x003A, LongLong, false;
        /// Whether the replica holds tentative writes
        HasTentativeWrites = 0x003D, Byte, false;
        /// Session token
        SessionToken = 0x003E, String, false;
        /// Backend processing time
        BackendRequestDurationMilliseconds = 0x0051, Double, false;
    }
}

pub mod kvpb {
    //! Wire messages of the key/value service, plus the log-entry and
    //! snapshot payloads that travel through the consensus layer.

    /// Outcome of a request as the clerk sees it.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
    pub enum ErrCode {
        Unknown = 0,
        Ok = 1,
        WrongLeader = 2,
        Timeout = 3,
    }

    /// What a committed log entry does when applied.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
    pub enum CommandKind {
        Unknown = 0,
        Get = 1,
        Put = 2,
        Append = 3,
        /// Internal garbage collection: drop a token's dedup record.
        Evict = 4,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct GetRequest {
        #[prost(string, tag = "1")]
        pub token: String,
        #[prost(string, tag = "2")]
        pub key: String,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct GetReply {
        #[prost(enumeration = "ErrCode", tag = "1")]
        pub err: i32,
        #[prost(string, tag = "2")]
        pub value: String,
    }

    /// Shared by the `put` and `append` rpcs.
    #[derive(Clone, PartialEq, Message)]
    pub struct PutAppendRequest {
        #[prost(string, tag = "1")]
        pub token: String,
        #[prost(string, tag = "2")]
        pub key: String,
        #[prost(string, tag = "3")]
        pub value: String,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct PutAppendReply {
        #[prost(enumeration = "ErrCode", tag = "1")]
        pub err: i32,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct NotifyRequest {
        /// Token of a request whose reply the clerk has consumed.
        #[prost(string, tag = "1")]
        pub token: String,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct NotifyReply {
        #[prost(enumeration = "ErrCode", tag = "1")]
        pub err: i32,
    }

    /// The operation record proposed to the consensus log.
    ///
    /// For `Evict`, `token` is empty and `key` names the token to drop.
    #[derive(Clone, PartialEq, Message)]
    pub struct Command {
        #[prost(string, tag = "1")]
        pub token: String,
        #[prost(enumeration = "CommandKind", tag = "2")]
        pub kind: i32,
        #[prost(string, tag = "3")]
        pub key: String,
        #[prost(string, tag = "4")]
        pub value: String,
    }

    /// Serialized capture of a replica's state machine. Map fields are
    /// tree-backed so the same state always encodes to the same bytes.
    #[derive(Clone, PartialEq, Message)]
    pub struct SnapshotState {
        #[prost(btree_map = "string, string", tag = "1")]
        pub kv: ::std::collections::BTreeMap<String, String>,
        #[prost(string, repeated, tag = "2")]
        pub executed: ::std::vec::Vec<String>,
        #[prost(btree_map = "string, string", tag = "3")]
        pub results: ::std::collections::BTreeMap<String, String>,
        #[prost(uint64, tag = "4")]
        pub last_applied_index: u64,
    }

    simrpc::service! {
        service kv {
            rpc get(GetRequest) returns (GetReply);
            rpc put(PutAppendRequest) returns (PutAppendReply);
            rpc append(PutAppendRequest) returns (PutAppendReply);
            rpc notify(NotifyRequest) returns (NotifyReply);
        }
    }
    pub use self::kv::{serve as serve_kv, Client as KvClient, Service as KvService};
}

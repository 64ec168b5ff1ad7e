// ------- Shared -------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoServerFault {
    #[prost(string, tag="1")]
    pub message: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoClientStaleTerm {
    #[prost(uint64, tag="1")]
    pub current_term: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoClusterMember {
    #[prost(string, tag="1")]
    pub replica_id: ::prost::alloc::string::String,
    #[prost(string, tag="2")]
    pub address: ::prost::alloc::string::String,
}
/// Payload of a CONFIG log entry. Always the full voter set.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoClusterConfig {
    #[prost(message, repeated, tag="1")]
    pub members: ::prost::alloc::vec::Vec<ProtoClusterMember>,
}
// ------- RequestVote -------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteReq {
    #[prost(string, tag="1")]
    pub client_node_id: ::prost::alloc::string::String,
    #[prost(uint64, tag="2")]
    pub term: u64,
    /// 0 means the candidate's log is empty.
    #[prost(uint64, tag="3")]
    pub last_log_entry_index: u64,
    #[prost(uint64, tag="4")]
    pub last_log_entry_term: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteResult {
    #[prost(oneof="proto_request_vote_result::Result", tags="1, 2")]
    pub result: ::core::option::Option<proto_request_vote_result::Result>,
}
/// Nested message and enum types in `ProtoRequestVoteResult`.
pub mod proto_request_vote_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag="1")]
        Ok(super::ProtoRequestVoteSuccess),
        #[prost(message, tag="2")]
        Err(super::ProtoRequestVoteError),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteSuccess {
    #[prost(bool, tag="1")]
    pub vote_granted: bool,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteError {
    #[prost(oneof="proto_request_vote_error::Err", tags="1")]
    pub err: ::core::option::Option<proto_request_vote_error::Err>,
}
/// Nested message and enum types in `ProtoRequestVoteError`.
pub mod proto_request_vote_error {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Err {
        #[prost(message, tag="1")]
        ServerFault(super::ProtoServerFault),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoLogEntry {
    #[prost(uint64, tag="1")]
    pub term: u64,
    #[prost(bytes="vec", tag="2")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    #[prost(enumeration="ProtoLogEntryKind", tag="3")]
    pub kind: i32,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesReq {
    #[prost(string, tag="1")]
    pub client_node_id: ::prost::alloc::string::String,
    #[prost(uint64, tag="2")]
    pub term: u64,
    #[prost(uint64, tag="3")]
    pub commit_index: u64,
    #[prost(uint64, tag="4")]
    pub previous_log_entry_term: u64,
    #[prost(uint64, tag="5")]
    pub previous_log_entry_index: u64,
    #[prost(message, repeated, tag="6")]
    pub new_entries: ::prost::alloc::vec::Vec<ProtoLogEntry>,
    /// Address the leader can be reached at, so followers can redirect callers.
    #[prost(string, tag="7")]
    pub client_address: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesResult {
    #[prost(oneof="proto_append_entries_result::Result", tags="1, 2")]
    pub result: ::core::option::Option<proto_append_entries_result::Result>,
}
/// Nested message and enum types in `ProtoAppendEntriesResult`.
pub mod proto_append_entries_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag="1")]
        Ok(super::ProtoAppendEntriesSuccess),
        #[prost(message, tag="2")]
        Err(super::ProtoAppendEntriesError),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesSuccess {
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesError {
    #[prost(oneof="proto_append_entries_error::Err", tags="1, 2, 3")]
    pub err: ::core::option::Option<proto_append_entries_error::Err>,
}
/// Nested message and enum types in `ProtoAppendEntriesError`.
pub mod proto_append_entries_error {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Err {
        #[prost(message, tag="1")]
        ServerFault(super::ProtoServerFault),
        #[prost(message, tag="2")]
        StaleTerm(super::ProtoClientStaleTerm),
        #[prost(message, tag="3")]
        MissingLog(super::ProtoServerMissingPreviousLog),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoServerMissingPreviousLog {
    /// Index of the last entry in the server's log, 0 if empty.
    #[prost(uint64, tag="1")]
    pub last_log_entry_index: u64,
}
// ------- InstallSnapshot -------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotReq {
    #[prost(string, tag="1")]
    pub client_node_id: ::prost::alloc::string::String,
    #[prost(uint64, tag="2")]
    pub term: u64,
    #[prost(string, tag="3")]
    pub client_address: ::prost::alloc::string::String,
    #[prost(uint64, tag="4")]
    pub last_included_index: u64,
    #[prost(uint64, tag="5")]
    pub last_included_term: u64,
    #[prost(message, optional, tag="6")]
    pub last_included_config: ::core::option::Option<ProtoClusterConfig>,
    #[prost(uint64, tag="7")]
    pub offset: u64,
    #[prost(bytes="vec", tag="8")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag="9")]
    pub done: bool,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotResult {
    #[prost(oneof="proto_install_snapshot_result::Result", tags="1, 2")]
    pub result: ::core::option::Option<proto_install_snapshot_result::Result>,
}
/// Nested message and enum types in `ProtoInstallSnapshotResult`.
pub mod proto_install_snapshot_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag="1")]
        Ok(super::ProtoInstallSnapshotSuccess),
        #[prost(message, tag="2")]
        Err(super::ProtoInstallSnapshotError),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotSuccess {
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotError {
    #[prost(oneof="proto_install_snapshot_error::Err", tags="1, 2, 3")]
    pub err: ::core::option::Option<proto_install_snapshot_error::Err>,
}
/// Nested message and enum types in `ProtoInstallSnapshotError`.
pub mod proto_install_snapshot_error {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Err {
        #[prost(message, tag="1")]
        ServerFault(super::ProtoServerFault),
        #[prost(message, tag="2")]
        StaleTerm(super::ProtoClientStaleTerm),
        #[prost(message, tag="3")]
        UnexpectedOffset(super::ProtoUnexpectedSnapshotOffset),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoUnexpectedSnapshotOffset {
    #[prost(uint64, tag="1")]
    pub expected_offset: u64,
}
// ------- ChangeMembership -------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoChangeMembershipReq {
    #[prost(oneof="proto_change_membership_req::Change", tags="1, 2")]
    pub change: ::core::option::Option<proto_change_membership_req::Change>,
}
/// Nested message and enum types in `ProtoChangeMembershipReq`.
pub mod proto_change_membership_req {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Change {
        #[prost(message, tag="1")]
        AddVoter(super::ProtoAddVoter),
        #[prost(message, tag="2")]
        RemoveServer(super::ProtoRemoveServer),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAddVoter {
    #[prost(string, tag="1")]
    pub replica_id: ::prost::alloc::string::String,
    #[prost(string, tag="2")]
    pub address: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRemoveServer {
    #[prost(string, tag="1")]
    pub replica_id: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoChangeMembershipResult {
    #[prost(oneof="proto_change_membership_result::Result", tags="1, 2")]
    pub result: ::core::option::Option<proto_change_membership_result::Result>,
}
/// Nested message and enum types in `ProtoChangeMembershipResult`.
pub mod proto_change_membership_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag="1")]
        Ok(super::ProtoChangeMembershipSuccess),
        #[prost(message, tag="2")]
        Err(super::ProtoChangeMembershipError),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoChangeMembershipSuccess {
    #[prost(uint64, tag="1")]
    pub config_index: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoChangeMembershipError {
    #[prost(oneof="proto_change_membership_error::Err", tags="1, 2, 3, 4")]
    pub err: ::core::option::Option<proto_change_membership_error::Err>,
}
/// Nested message and enum types in `ProtoChangeMembershipError`.
pub mod proto_change_membership_error {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Err {
        #[prost(message, tag="1")]
        ServerFault(super::ProtoServerFault),
        #[prost(message, tag="2")]
        NotLeader(super::ProtoNotLeader),
        #[prost(message, tag="3")]
        ChangeInProgress(super::ProtoChangeInProgress),
        #[prost(message, tag="4")]
        NotCommitted(super::ProtoNotCommitted),
    }
}
/// Empty leader_id means the server doesn't know who the leader is.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoNotLeader {
    #[prost(string, tag="1")]
    pub leader_id: ::prost::alloc::string::String,
    #[prost(string, tag="2")]
    pub leader_address: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoChangeInProgress {
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoNotCommitted {
    #[prost(string, tag="1")]
    pub message: ::prost::alloc::string::String,
}
// ------- AppendEntries -------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProtoLogEntryKind {
    Command = 0,
    Config = 1,
    Noop = 2,
}
# [doc = r" Generated client implementations."] pub mod grpc_raft_client { # ! [allow (unused_variables , dead_code , missing_docs)] use tonic :: codegen :: * ; pub struct GrpcRaftClient < T > { inner : tonic :: client :: Grpc < T > , } impl GrpcRaftClient < tonic :: transport :: Channel > { # [doc = r" Attempt to create a new client by connecting to a given endpoint."] pub async fn connect < D > (dst : D) -> Result < Self , tonic :: transport :: Error > where D : std :: convert :: TryInto < tonic :: transport :: Endpoint > , D :: Error : Into < StdError > , { let conn = tonic :: transport :: Endpoint :: new (dst) ? . connect () . await ? ; Ok (Self :: new (conn)) } } impl < T > GrpcRaftClient < T > where T : tonic :: client :: GrpcService < tonic :: body :: BoxBody > , T :: ResponseBody : Body + HttpBody + Send + 'static , T :: Error : Into < StdError > , < T :: ResponseBody as HttpBody > :: Error : Into < StdError > + Send , { pub fn new (inner : T) -> Self { let inner = tonic :: client :: Grpc :: new (inner) ; Self { inner } } pub fn with_interceptor (inner : T , interceptor : impl Into < tonic :: Interceptor >) -> Self { let inner = tonic :: client :: Grpc :: with_interceptor (inner , interceptor) ; Self { inner } } pub async fn request_vote (& mut self , request : impl tonic :: IntoRequest < super :: ProtoRequestVoteReq > ,) -> Result < tonic :: Response < super :: ProtoRequestVoteResult > , tonic :: Status > { self . inner . ready () . await . map_err (| e | { tonic :: Status :: new (tonic :: Code :: Unknown , format ! ("Service was not ready: {}" , e . into ())) }) ? ; let codec = tonic :: codec :: ProstCodec :: default () ; let path = http :: uri :: PathAndQuery :: from_static ("/raft.GrpcRaft/RequestVote") ; self . inner . unary (request . into_request () , path , codec) . await } pub async fn append_entries (& mut self , request : impl tonic :: IntoRequest < super :: ProtoAppendEntriesReq > ,) -> Result < tonic :: Response < super :: ProtoAppendEntriesResult > , tonic :: Status > { self . inner . ready () . await . map_err (| e | { tonic :: Status :: new (tonic :: Code :: Unknown , format ! ("Service was not ready: {}" , e . into ())) }) ? ; let codec = tonic :: codec :: ProstCodec :: default () ; let path = http :: uri :: PathAndQuery :: from_static ("/raft.GrpcRaft/AppendEntries") ; self . inner . unary (request . into_request () , path , codec) . await } pub async fn install_snapshot (& mut self , request : impl tonic :: IntoRequest < super :: ProtoInstallSnapshotReq > ,) -> Result < tonic :: Response < super :: ProtoInstallSnapshotResult > , tonic :: Status > { self . inner . ready () . await . map_err (| e | { tonic :: Status :: new (tonic :: Code :: Unknown , format ! ("Service was not ready: {}" , e . into ())) }) ? ; let codec = tonic :: codec :: ProstCodec :: default () ; let path = http :: uri :: PathAndQuery :: from_static ("/raft.GrpcRaft/InstallSnapshot") ; self . inner . unary (request . into_request () , path , codec) . await } pub async fn change_membership (& mut self , request : impl tonic :: IntoRequest < super :: ProtoChangeMembershipReq > ,) -> Result < tonic :: Response < super :: ProtoChangeMembershipResult > , tonic :: Status > { self . inner . ready () . await . map_err (| e | { tonic :: Status :: new (tonic :: Code :: Unknown , format ! ("Service was not ready: {}" , e . into ())) }) ? ; let codec = tonic :: codec :: ProstCodec :: default () ; let path = http :: uri :: PathAndQuery :: from_static ("/raft.GrpcRaft/ChangeMembership") ; self . inner . unary (request . into_request () , path , codec) . await } } impl < T : Clone > Clone for GrpcRaftClient < T > { fn clone (& self) -> Self { Self { inner : self . inner . clone () , } } } impl < T > std :: fmt :: Debug for GrpcRaftClient < T > { fn fmt (& self , f : & mut std :: fmt :: Formatter < '_ >) -> std :: fmt :: Result { write ! (f , "GrpcRaftClient {{ ... }}") } } }# [doc = r" Generated server implementations."] pub mod grpc_raft_server { # ! [allow (unused_variables , dead_code , missing_docs)] use tonic :: codegen :: * ; # [doc = "Generated trait containing gRPC methods that should be implemented for use with GrpcRaftServer."] # [async_trait] pub trait GrpcRaft : Send + Sync + 'static { async fn request_vote (& self , request : tonic :: Request < super :: ProtoRequestVoteReq >) -> Result < tonic :: Response < super :: ProtoRequestVoteResult > , tonic :: Status > ; async fn append_entries (& self , request : tonic :: Request < super :: ProtoAppendEntriesReq >) -> Result < tonic :: Response < super :: ProtoAppendEntriesResult > , tonic :: Status > ; async fn install_snapshot (& self , request : tonic :: Request < super :: ProtoInstallSnapshotReq >) -> Result < tonic :: Response < super :: ProtoInstallSnapshotResult > , tonic :: Status > ; async fn change_membership (& self , request : tonic :: Request < super :: ProtoChangeMembershipReq >) -> Result < tonic :: Response < super :: ProtoChangeMembershipResult > , tonic :: Status > ; } # [derive (Debug)] pub struct GrpcRaftServer < T : GrpcRaft > { inner : _Inner < T > , } struct _Inner < T > (Arc < T > , Option < tonic :: Interceptor >) ; impl < T : GrpcRaft > GrpcRaftServer < T > { pub fn new (inner : T) -> Self { let inner = Arc :: new (inner) ; let inner = _Inner (inner , None) ; Self { inner } } pub fn with_interceptor (inner : T , interceptor : impl Into < tonic :: Interceptor >) -> Self { let inner = Arc :: new (inner) ; let inner = _Inner (inner , Some (interceptor . into ())) ; Self { inner } } } impl < T , B > Service < http :: Request < B >> for GrpcRaftServer < T > where T : GrpcRaft , B : HttpBody + Send + Sync + 'static , B :: Error : Into < StdError > + Send + 'static , { type Response = http :: Response < tonic :: body :: BoxBody > ; type Error = Never ; type Future = BoxFuture < Self :: Response , Self :: Error > ; fn poll_ready (& mut self , _cx : & mut Context < '_ >) -> Poll < Result < () , Self :: Error >> { Poll :: Ready (Ok (())) } fn call (& mut self , req : http :: Request < B >) -> Self :: Future { let inner = self . inner . clone () ; match req . uri () . path () { "/raft.GrpcRaft/RequestVote" => { # [allow (non_camel_case_types)] struct RequestVoteSvc < T : GrpcRaft > (pub Arc < T >) ; impl < T : GrpcRaft > tonic :: server :: UnaryService < super :: ProtoRequestVoteReq > for RequestVoteSvc < T > { type Response = super :: ProtoRequestVoteResult ; type Future = BoxFuture < tonic :: Response < Self :: Response > , tonic :: Status > ; fn call (& mut self , request : tonic :: Request < super :: ProtoRequestVoteReq >) -> Self :: Future { let inner = self . 0 . clone () ; let fut = async move { (* inner) . request_vote (request) . await } ; Box :: pin (fut) } } let inner = self . inner . clone () ; let fut = async move { let interceptor = inner . 1 . clone () ; let inner = inner . 0 ; let method = RequestVoteSvc (inner) ; let codec = tonic :: codec :: ProstCodec :: default () ; let mut grpc = if let Some (interceptor) = interceptor { tonic :: server :: Grpc :: with_interceptor (codec , interceptor) } else { tonic :: server :: Grpc :: new (codec) } ; let res = grpc . unary (method , req) . await ; Ok (res) } ; Box :: pin (fut) } "/raft.GrpcRaft/AppendEntries" => { # [allow (non_camel_case_types)] struct AppendEntriesSvc < T : GrpcRaft > (pub Arc < T >) ; impl < T : GrpcRaft > tonic :: server :: UnaryService < super :: ProtoAppendEntriesReq > for AppendEntriesSvc < T > { type Response = super :: ProtoAppendEntriesResult ; type Future = BoxFuture < tonic :: Response < Self :: Response > , tonic :: Status > ; fn call (& mut self , request : tonic :: Request < super :: ProtoAppendEntriesReq >) -> Self :: Future { let inner = self . 0 . clone () ; let fut = async move { (* inner) . append_entries (request) . await } ; Box :: pin (fut) } } let inner = self . inner . clone () ; let fut = async move { let interceptor = inner . 1 . clone () ; let inner = inner . 0 ; let method = AppendEntriesSvc (inner) ; let codec = tonic :: codec :: ProstCodec :: default () ; let mut grpc = if let Some (interceptor) = interceptor { tonic :: server :: Grpc :: with_interceptor (codec , interceptor) } else { tonic :: server :: Grpc :: new (codec) } ; let res = grpc . unary (method , req) . await ; Ok (res) } ; Box :: pin (fut) } "/raft.GrpcRaft/InstallSnapshot" => { # [allow (non_camel_case_types)] struct InstallSnapshotSvc < T : GrpcRaft > (pub Arc < T >) ; impl < T : GrpcRaft > tonic :: server :: UnaryService < super :: ProtoInstallSnapshotReq > for InstallSnapshotSvc < T > { type Response = super :: ProtoInstallSnapshotResult ; type Future = BoxFuture < tonic :: Response < Self :: Response > , tonic :: Status > ; fn call (& mut self , request : tonic :: Request < super :: ProtoInstallSnapshotReq >) -> Self :: Future { let inner = self . 0 . clone () ; let fut = async move { (* inner) . install_snapshot (request) . await } ; Box :: pin (fut) } } let inner = self . inner . clone () ; let fut = async move { let interceptor = inner . 1 . clone () ; let inner = inner . 0 ; let method = InstallSnapshotSvc (inner) ; let codec = tonic :: codec :: ProstCodec :: default () ; let mut grpc = if let Some (interceptor) = interceptor { tonic :: server :: Grpc :: with_interceptor (codec , interceptor) } else { tonic :: server :: Grpc :: new (codec) } ; let res = grpc . unary (method , req) . await ; Ok (res) } ; Box :: pin (fut) } "/raft.GrpcRaft/ChangeMembership" => { # [allow (non_camel_case_types)] struct ChangeMembershipSvc < T : GrpcRaft > (pub Arc < T >) ; impl < T : GrpcRaft > tonic :: server :: UnaryService < super :: ProtoChangeMembershipReq > for ChangeMembershipSvc < T > { type Response = super :: ProtoChangeMembershipResult ; type Future = BoxFuture < tonic :: Response < Self :: Response > , tonic :: Status > ; fn call (& mut self , request : tonic :: Request < super :: ProtoChangeMembershipReq >) -> Self :: Future { let inner = self . 0 . clone () ; let fut = async move { (* inner) . change_membership (request) . await } ; Box :: pin (fut) } } let inner = self . inner . clone () ; let fut = async move { let interceptor = inner . 1 . clone () ; let inner = inner . 0 ; let method = ChangeMembershipSvc (inner) ; let codec = tonic :: codec :: ProstCodec :: default () ; let mut grpc = if let Some (interceptor) = interceptor { tonic :: server :: Grpc :: with_interceptor (codec , interceptor) } else { tonic :: server :: Grpc :: new (codec) } ; let res = grpc . unary (method , req) . await ; Ok (res) } ; Box :: pin (fut) } _ => Box :: pin (async move { Ok (http :: Response :: builder () . status (200) . header ("grpc-status" , "12") . header ("content-type" , "application/grpc") . body (tonic :: body :: BoxBody :: empty ()) . unwrap ()) }) , } } } impl < T : GrpcRaft > Clone for GrpcRaftServer < T > { fn clone (& self) -> Self { let inner = self . inner . clone () ; Self { inner } } } impl < T : GrpcRaft > Clone for _Inner < T > { fn clone (& self) -> Self { Self (self . 0 . clone () , self . 1 . clone ()) } } impl < T : std :: fmt :: Debug > std :: fmt :: Debug for _Inner < T > { fn fmt (& self , f : & mut std :: fmt :: Formatter < '_ >) -> std :: fmt :: Result { write ! (f , "{:?}" , self . 0) } } impl < T : GrpcRaft > tonic :: transport :: NamedService for GrpcRaftServer < T > { const NAME : & 'static str = "raft.GrpcRaft" ; } }
pub mod access;
pub mod acl_store;
pub mod path_resolver;
pub mod signer;
pub mod sink;
pub mod storage_service;
pub mod stream_adapter;

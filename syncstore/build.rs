use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "crate::rpc::BincodeCodec";

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(input)
        .output_type(output)
        .codec_path(CODEC)
        .build()
}

fn main() {
    let raft = Service::builder()
        .name("Raft")
        .package("syncstore")
        .method(unary(
            "append_entries",
            "AppendEntries",
            "crate::raft::AppendEntriesRequest",
            "crate::raft::AppendEntriesReply",
        ))
        .method(unary(
            "claim_leadership",
            "ClaimLeadership",
            "crate::raft::ClaimRequest",
            "crate::raft::ClaimReply",
        ))
        .method(unary(
            "fetch_entries",
            "FetchEntries",
            "crate::raft::FetchRequest",
            "crate::rpc::EntriesReply",
        ))
        .method(unary(
            "update_file",
            "UpdateFile",
            "crate::metadata::FileMetadata",
            "crate::rpc::VersionReply",
        ))
        .method(unary(
            "get_file_info_map",
            "GetFileInfoMap",
            "crate::rpc::Empty",
            "crate::rpc::FileInfoMapReply",
        ))
        .method(unary(
            "assign_leader",
            "AssignLeader",
            "crate::rpc::Empty",
            "crate::rpc::Empty",
        ))
        .method(unary("heartbeat", "Heartbeat", "crate::rpc::Empty", "crate::rpc::Empty"))
        .method(unary("crash", "Crash", "crate::rpc::Empty", "crate::rpc::Empty"))
        .method(unary("restore", "Restore", "crate::rpc::Empty", "crate::rpc::Empty"))
        .method(unary(
            "get_internal_state",
            "GetInternalState",
            "crate::rpc::Empty",
            "crate::raft::InternalState",
        ))
        .build();

    let blocks = Service::builder()
        .name("Blocks")
        .package("syncstore")
        .method(unary(
            "has_blocks",
            "HasBlocks",
            "crate::rpc::HashList",
            "crate::rpc::HashList",
        ))
        .method(unary(
            "get_block",
            "GetBlock",
            "crate::rpc::BlockHash",
            "crate::rpc::BlockData",
        ))
        .method(unary(
            "put_block",
            "PutBlock",
            "crate::rpc::BlockData",
            "crate::rpc::BlockHash",
        ))
        .build();

    Builder::new().compile(&[raft, blocks]);
    println!("cargo:rerun-if-changed=build.rs");
}

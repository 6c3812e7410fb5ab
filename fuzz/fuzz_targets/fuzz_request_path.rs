#![no_main]
use libfuzzer_sys::fuzz_target;

use lfs_gateway::repository::RepositoryRef;

fuzz_target!(|path: &str| {
    let _ = RepositoryRef::from_request_path(path);
    let _ = RepositoryRef::from_ssh_target(path);
});

#![no_main]
use libfuzzer_sys::fuzz_target;

use lfs_gateway::command::SshCommand;

fuzz_target!(|data: &[u8]| {
    // The result is acceptable as long as a panic does not result
    let _ = SshCommand::parse(data);
});

use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};

pub const PROCESS_SPILL__AFTER_STAGE: &str = "process_spill.after_stage";

pub fn sync_fail_point(name: &str) -> SyncResult<()> {
    fail_point!(name, |_| {
        bail!(
            ErrorKind::FailPoint,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}

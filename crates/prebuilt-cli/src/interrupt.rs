use tokio_util::sync::CancellationToken;

/// Exit status conventionally used for SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Cancel `cancel` on the first Ctrl-C and exit on the second.
///
/// The first interrupt lets in-flight transfers unwind so staged downloads
/// are cleaned up; a second one exits immediately.
pub fn install(cancel: CancellationToken) {
    let spawned = std::thread::Builder::new()
        .name("prebuilt-interrupt".to_owned())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    tracing::debug!(error = %err, "failed to start interrupt handler runtime");
                    return;
                }
            };
            runtime.block_on(async move {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                tracing::warn!("interrupted; cancelling remote transfers (press Ctrl-C again to exit)");
                cancel.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
            });
        });
    if let Err(err) = spawned {
        tracing::debug!(error = %err, "failed to spawn interrupt handler");
    }
}

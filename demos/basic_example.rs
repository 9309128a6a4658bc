use log::{LevelFilter, error, info};
use std::time::Duration;
use tokio_process_control::ProcessController;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::env_logger::builder().format_timestamp(None).filter_level(LevelFilter::Debug).init();
    info!("interactive shell example");

    let process = ProcessController::new();
    process.set_started_callback(|| println!("[SHELL]: started"));
    process.set_ready_read_standard_output_callback(|bytes| print!("[SHELL]: {}", String::from_utf8_lossy(bytes)));
    process.set_ready_read_standard_error_callback(|bytes| eprint!("[SHELL ERROR]: {}", String::from_utf8_lossy(bytes)));
    process.set_error_callback(|err| error!("shell reported {}", err));
    process.set_finished_callback(|code, status| println!("[SHELL]: finished with {} ({:?})", code, status));

    #[cfg(windows)]
    process.start("cmd.exe", ["/Q"])?;
    #[cfg(not(windows))]
    process.start("sh", Vec::<String>::new())?;

    for i in 0..5 {
        process.write(format!("echo iteration {}\n", i))?;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // Ask the shell to exit on its own; fall back to a shutdown if it hangs.
    process.write("exit\n")?;
    if !process.wait_for_finished_async(Some(Duration::from_secs(5))).await {
        process.shutdown(Duration::from_secs(2));
    }

    Ok(())
}

use tool_proxy::cli::run_tool_proxy;

fn main() {
    if let Err(err) = run_tool_proxy() {
        tracing::error!(error = %err, "tool-proxy failed");
        std::process::exit(1);
    }
}

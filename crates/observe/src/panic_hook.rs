/// Routes panic messages through tracing so they end up in the structured
/// log stream instead of raw stderr.
pub fn install() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(panic = %info, "thread panicked");
        default_hook(info);
    }));
}

use clap::Parser;
use truvis_winit_app::app::WinitApp;
use truvis_winit_app::cli::RenderOptions;
use truvis_winit_app::frame_loop::run_offscreen;

fn main() -> anyhow::Result<()> {
    WinitApp::init_env();

    let opts = RenderOptions::parse();
    log::info!("render options: {:?}", opts);

    if opts.windowed() {
        WinitApp::run(opts)
    } else {
        run_offscreen(&opts).map(|_| ())
    }
}

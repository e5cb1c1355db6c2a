//! Interactive TUI for browsing external drives and running operations on them.

mod app;
mod input;
mod ui;

use std::io::{self, stdout};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossterm::{
    event, execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{Terminal, backend::CrosstermBackend};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::context::AppContext;
use crate::core::DeviceAction;

use app::TuiApp;

/// How often the screen is redrawn from the device store.
const REDRAW_INTERVAL: Duration = Duration::from_millis(200);

/// Run the TUI until the user quits.
pub async fn run(ctx: AppContext) -> Result<()> {
    let cancel = CancellationToken::new();
    let refresh = ctx.refresh_loop().spawn(cancel.clone());

    // Setup terminal
    enable_raw_mode().context("Failed to enable raw mode")?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen).context("Failed to enter alternate screen")?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("Failed to create terminal")?;

    let mut app = TuiApp::new(&ctx);
    let result = run_app(&mut terminal, &mut app).await;

    // Restore terminal
    disable_raw_mode().context("Failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("Failed to leave alternate screen")?;
    terminal.show_cursor().context("Failed to show cursor")?;

    let grace = Duration::from_millis(ctx.config.clone.terminate_grace_ms) + Duration::from_secs(1);
    wait_for_clones(&ctx, grace).await;

    cancel.cancel();
    let _ = refresh.await;

    result
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut TuiApp,
) -> Result<()> {
    app.sync().await;

    loop {
        terminal.draw(|frame| ui::render(frame, app))?;

        if event::poll(REDRAW_INTERVAL)? {
            let event = event::read()?;
            if let Some(action) = input::handle_event(event) {
                app.handle_action(action).await;
            }
        }
        app.sync().await;

        if !app.running {
            break;
        }
    }

    Ok(())
}

/// Cancelled clones finish on their own tasks; let them clean up before exit.
async fn wait_for_clones(ctx: &AppContext, limit: Duration) {
    let deadline = Instant::now() + limit;
    loop {
        let busy = ctx
            .store
            .snapshot()
            .await
            .iter()
            .any(|d| d.state.action == DeviceAction::Cloning);
        if !busy {
            return;
        }
        if Instant::now() >= deadline {
            warn!("Exiting with a clone still running");
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

//! UI rendering for the TUI.

use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, Paragraph, Wrap},
};

use crate::core::{Device, DeviceAction};

use super::app::{TuiApp, View, status_text};

/// Main render function - draws the drive list, then any open dialog on top.
pub fn render(frame: &mut Frame, app: &TuiApp) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(0),    // Drive list
            Constraint::Length(3), // Footer/help
        ])
        .split(frame.area());

    render_header(frame, app, chunks[0]);
    render_devices(frame, app, chunks[1]);
    render_footer(frame, app, chunks[2]);

    match &app.view {
        View::Devices => {}
        View::ActionMenu { device, selected } => render_menu(frame, app, device, *selected),
        View::PartitionPicker { device, selected } => {
            render_picker(frame, app, device, *selected)
        }
        View::Confirm {
            target,
            destination,
        } => render_confirm(frame, target, &destination.display().to_string()),
    }
}

fn render_header(frame: &mut Frame, app: &TuiApp, area: Rect) {
    let mode = if app.simulation { " [SIM]" } else { "" };
    let title = format!(
        "extdrive  v{}  {} drive(s){}",
        env!("CARGO_PKG_VERSION"),
        app.devices.len(),
        mode
    );

    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    frame.render_widget(block, area);
}

fn render_devices(frame: &mut Frame, app: &TuiApp, area: Rect) {
    let block = Block::default()
        .title("External Drives")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    if app.devices.is_empty() {
        let text = Paragraph::new("  No external drives detected")
            .style(Style::default().fg(Color::DarkGray))
            .block(block);
        frame.render_widget(text, area);
        return;
    }

    let items: Vec<ListItem> = app
        .devices
        .iter()
        .enumerate()
        .map(|(i, device)| {
            let is_selected = i == app.selected;
            let style = if is_selected {
                Style::default()
                    .bg(Color::DarkGray)
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            ListItem::new(device_line(device, is_selected)).style(style)
        })
        .collect();

    let list = List::new(items).block(block);
    frame.render_widget(list, area);
}

fn device_line(device: &Device, is_selected: bool) -> Line<'static> {
    let icon = match device.state.action {
        DeviceAction::Idle => Span::styled("•", Style::default().fg(Color::Green)),
        DeviceAction::Unmounting => Span::styled("⏏", Style::default().fg(Color::Yellow)),
        DeviceAction::Cloning => Span::styled("▶", Style::default().fg(Color::Yellow)),
    };

    let mut spans = vec![
        Span::raw(if is_selected { "> " } else { "  " }),
        icon,
        Span::raw(format!(
            "  {:<28} {:>10} {:>10} used  {} part.  ",
            truncate(&device.name, 28),
            device.size_str(),
            device.used_str(),
            device.partition_count(),
        )),
    ];

    if device.read_only {
        spans.push(Span::styled("ro  ", Style::default().fg(Color::Red)));
    }

    match device.state.action {
        DeviceAction::Cloning => spans.push(Span::raw(format!(
            "{} {:>3}%",
            progress_bar(device.state.progress, 20),
            device.state.progress
        ))),
        _ => spans.push(Span::styled(
            status_text(device),
            Style::default().fg(Color::DarkGray),
        )),
    }

    Line::from(spans)
}

fn render_menu(frame: &mut Frame, app: &TuiApp, kname: &str, selected: usize) {
    let title = app
        .device(kname)
        .map(|d| format!("{} ({})", d.name, d.kname))
        .unwrap_or_else(|| kname.to_string());

    let items: Vec<ListItem> = app
        .menu_items(kname)
        .iter()
        .enumerate()
        .map(|(i, item)| selectable(item.label().to_string(), i == selected))
        .collect();

    let area = popup_area(frame.area(), 40, items.len() as u16 + 2);
    render_popup_list(frame, area, title, items);
}

fn render_picker(frame: &mut Frame, app: &TuiApp, kname: &str, selected: usize) {
    let items: Vec<ListItem> = app
        .picker_targets(kname)
        .into_iter()
        .enumerate()
        .map(|(i, (label, _))| selectable(label, i == selected))
        .collect();

    let area = popup_area(frame.area(), 50, items.len() as u16 + 2);
    render_popup_list(frame, area, "Save what?".to_string(), items);
}

fn render_confirm(frame: &mut Frame, target: &str, destination: &str) {
    let lines = vec![
        Line::from(vec![
            Span::styled("  Source:      ", Style::default().fg(Color::Cyan)),
            Span::raw(target.to_string()),
        ]),
        Line::from(vec![
            Span::styled("  Destination: ", Style::default().fg(Color::Cyan)),
            Span::raw(destination.to_string()),
        ]),
        Line::from(""),
        Line::from(Span::styled(
            "  [Enter] Start  [Esc] Cancel",
            Style::default().fg(Color::Yellow),
        )),
    ];

    let area = popup_area(frame.area(), 70, lines.len() as u16 + 2);
    let block = Block::default()
        .title("Save drive image")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));
    let paragraph = Paragraph::new(lines)
        .block(block)
        .wrap(Wrap { trim: false });

    frame.render_widget(Clear, area);
    frame.render_widget(paragraph, area);
}

fn selectable(label: String, is_selected: bool) -> ListItem<'static> {
    let style = if is_selected {
        Style::default()
            .bg(Color::DarkGray)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };
    let prefix = if is_selected { "> " } else { "  " };
    ListItem::new(format!("{}{}", prefix, label)).style(style)
}

fn render_popup_list(frame: &mut Frame, area: Rect, title: String, items: Vec<ListItem>) {
    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    frame.render_widget(Clear, area);
    frame.render_widget(List::new(items).block(block), area);
}

fn render_footer(frame: &mut Frame, app: &TuiApp, area: Rect) {
    let help_text = match &app.view {
        View::Devices => "[↑↓] Navigate  [Enter] Actions  [r] Refresh  [q] Quit",
        View::ActionMenu { .. } | View::PartitionPicker { .. } => {
            "[↑↓] Navigate  [Enter] Select  [Esc] Back  [q] Quit"
        }
        View::Confirm { .. } => "[Enter] Start  [Esc] Cancel",
    };

    let mut spans = vec![Span::raw(format!("  {}", help_text))];

    if let Some(notification) = &app.notification {
        let color = if notification.is_error {
            Color::Red
        } else {
            Color::Green
        };
        spans.push(Span::styled(
            format!("  {}", notification.message),
            Style::default().fg(color),
        ));
    }

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let paragraph = Paragraph::new(Line::from(spans)).block(block);
    frame.render_widget(paragraph, area);
}

/// A centered rectangle `width` percent wide and `height` rows tall.
fn popup_area(area: Rect, width: u16, height: u16) -> Rect {
    let height = height.min(area.height);
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Fill(1),
            Constraint::Length(height),
            Constraint::Fill(1),
        ])
        .split(area);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - width) / 2),
            Constraint::Percentage(width),
            Constraint::Percentage((100 - width) / 2),
        ])
        .split(vertical[1])[1]
}

fn progress_bar(percentage: u8, width: usize) -> String {
    let percentage = percentage.min(100) as usize;
    let filled = (percentage * width) / 100;
    let empty = width - filled;
    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_bar_bounds() {
        assert_eq!(progress_bar(0, 4), "[░░░░]");
        assert_eq!(progress_bar(50, 4), "[██░░]");
        assert_eq!(progress_bar(200, 4), "[████]");
    }

    #[test]
    fn truncate_long_names() {
        assert_eq!(truncate("SanDisk Cruzer", 28), "SanDisk Cruzer");
        assert_eq!(truncate("abcdefghij", 6), "abc...");
    }
}

use std::io::IsTerminal;

use comfy_table::{presets::NOTHING, Attribute, Cell, Table};

/// Styling for terminal tables: bold headers on a colour-capable TTY.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TableStyle {
    pub bold: bool,
}

impl TableStyle {
    pub(crate) fn detect() -> Self {
        Self::resolve(
            std::io::stdout().is_terminal(),
            std::env::var_os("NO_COLOR").is_some(),
        )
    }

    fn resolve(is_tty: bool, no_color: bool) -> Self {
        Self {
            bold: is_tty && !no_color,
        }
    }

    pub(crate) fn table(self, headers: &[&str]) -> Table {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_header(headers.iter().map(|h| {
            let cell = Cell::new(h);
            if self.bold {
                cell.add_attribute(Attribute::Bold)
            } else {
                cell
            }
        }));
        table
    }
}

use cli_table::format::Justify;
use cli_table::{Cell, ColorChoice, Style, Table};

/// Renders a titled table into a string, used for multi-line diagnostic log messages.
pub fn render_table(header: &[&str], rows: Vec<Vec<String>>) -> String {
    let rows = rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|value| value.cell().justify(Justify::Left))
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();
    let title = header
        .iter()
        .map(|h| h.cell().bold(true))
        .collect::<Vec<_>>();
    match rows
        .table()
        .title(title)
        .color_choice(ColorChoice::Never)
        .display()
    {
        Ok(display) => display.to_string(),
        Err(error) => format!("<cannot render table: {error}>"),
    }
}

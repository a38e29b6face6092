use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use entity_consolidation::db::{get_all_associations, get_entities, get_latest_run, get_review_queue};
use entity_consolidation::{
    AssociationRecord, CanonicalEntity, EntityType, QualityRating, ReviewQueue, RunManifest,
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Entities,
    Associations,
    ReviewQueue,
}

impl Page {
    pub fn next(&self) -> Self {
        match self {
            Page::Entities => Page::Associations,
            Page::Associations => Page::ReviewQueue,
            Page::ReviewQueue => Page::Entities,
        }
    }

    pub fn previous(&self) -> Self {
        match self {
            Page::Entities => Page::ReviewQueue,
            Page::Associations => Page::Entities,
            Page::ReviewQueue => Page::Associations,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Page::Entities => "Entities",
            Page::Associations => "Associations",
            Page::ReviewQueue => "Review Queue",
        }
    }
}

/// One line of the review page: an unrecommended reference or a flagged entity
#[derive(Debug, Clone)]
pub struct ReviewRow {
    pub kind: &'static str,
    pub entity_type: EntityType,
    pub id: String,
    pub reason: String,
}

pub struct App {
    pub entities: Vec<CanonicalEntity>,
    pub associations: Vec<AssociationRecord>,
    pub review: ReviewQueue,
    pub run: Option<RunManifest>,
    pub filter: Option<EntityType>,
    pub current_page: Page,
    pub show_detail: bool,
    entity_rows: Vec<usize>,
    association_rows: Vec<usize>,
    review_rows: Vec<ReviewRow>,
    pub entity_state: TableState,
    pub association_state: TableState,
    pub review_state: TableState,
}

impl App {
    pub fn new(
        entities: Vec<CanonicalEntity>,
        associations: Vec<AssociationRecord>,
        review: ReviewQueue,
        run: Option<RunManifest>,
    ) -> Self {
        let mut app = Self {
            entities,
            associations,
            review,
            run,
            filter: None,
            current_page: Page::Entities,
            show_detail: false,
            entity_rows: Vec::new(),
            association_rows: Vec::new(),
            review_rows: Vec::new(),
            entity_state: TableState::default(),
            association_state: TableState::default(),
            review_state: TableState::default(),
        };
        app.apply_filter(None);
        app
    }

    pub fn load(conn: &Connection) -> Result<Self> {
        Ok(Self::new(
            get_entities(conn, None)?,
            get_all_associations(conn)?,
            get_review_queue(conn)?,
            get_latest_run(conn)?,
        ))
    }

    pub fn toggle_detail(&mut self) {
        self.show_detail = !self.show_detail;
    }

    /// Restrict every page to one entity type (None shows all)
    pub fn apply_filter(&mut self, filter: Option<EntityType>) {
        self.filter = filter;
        let keep = |t: EntityType| filter.map_or(true, |f| f == t);
        let prefix_of = |id: &str| -> bool {
            match filter {
                None => true,
                Some(f) => id.starts_with(&format!("{}-", f.id_prefix())),
            }
        };

        self.entity_rows = (0..self.entities.len())
            .filter(|&i| keep(self.entities[i].entity_type))
            .collect();

        self.association_rows = (0..self.associations.len())
            .filter(|&i| {
                let a = &self.associations[i];
                prefix_of(&a.entity_id) || prefix_of(&a.counterpart_id)
            })
            .collect();

        let mut rows: Vec<ReviewRow> = self
            .review
            .references
            .iter()
            .filter(|r| keep(r.entity_type))
            .map(|r| ReviewRow {
                kind: "XREF",
                entity_type: r.entity_type,
                id: if r.canonical_id.is_empty() {
                    "(missing id)".to_string()
                } else {
                    r.canonical_id.clone()
                },
                reason: if r.flags.is_empty() {
                    format!("{} / {}", r.confidence.as_str(), r.validation.as_str())
                } else {
                    join_flags(r.flags.iter().map(|f| f.to_string()))
                },
            })
            .collect();
        rows.extend(
            self.review
                .entities
                .iter()
                .filter(|e| keep(e.entity_type))
                .map(|e| ReviewRow {
                    kind: "ENTITY",
                    entity_type: e.entity_type,
                    id: e.id.clone(),
                    reason: join_flags(e.flags.iter().map(|f| f.to_string())),
                }),
        );
        self.review_rows = rows;

        reset_selection(&mut self.entity_state, self.entity_rows.len());
        reset_selection(&mut self.association_state, self.association_rows.len());
        reset_selection(&mut self.review_state, self.review_rows.len());
    }

    pub fn clear_filter(&mut self) {
        self.apply_filter(None);
    }

    pub fn next_page(&mut self) {
        self.current_page = self.current_page.next();
    }

    pub fn previous_page(&mut self) {
        self.current_page = self.current_page.previous();
    }

    pub fn selected_entity(&self) -> Option<&CanonicalEntity> {
        self.entity_state
            .selected()
            .and_then(|i| self.entity_rows.get(i))
            .map(|&i| &self.entities[i])
    }

    pub fn selected_association(&self) -> Option<&AssociationRecord> {
        self.association_state
            .selected()
            .and_then(|i| self.association_rows.get(i))
            .map(|&i| &self.associations[i])
    }

    /// Entity counts per type, unfiltered
    pub fn counts(&self) -> BTreeMap<EntityType, usize> {
        let mut counts = BTreeMap::new();
        for entity in &self.entities {
            *counts.entry(entity.entity_type).or_insert(0) += 1;
        }
        counts
    }

    fn current_len(&self) -> usize {
        match self.current_page {
            Page::Entities => self.entity_rows.len(),
            Page::Associations => self.association_rows.len(),
            Page::ReviewQueue => self.review_rows.len(),
        }
    }

    fn current_state(&mut self) -> &mut TableState {
        match self.current_page {
            Page::Entities => &mut self.entity_state,
            Page::Associations => &mut self.association_state,
            Page::ReviewQueue => &mut self.review_state,
        }
    }

    fn move_by(&mut self, delta: isize, wrap: bool) {
        let len = self.current_len();
        if len == 0 {
            return;
        }
        let state = self.current_state();
        let current = state.selected().unwrap_or(0) as isize;
        let last = len as isize - 1;
        let target = current + delta;
        let i = if wrap {
            if target > last {
                0
            } else if target < 0 {
                last
            } else {
                target
            }
        } else {
            target.clamp(0, last)
        };
        state.select(Some(i as usize));
    }

    pub fn next(&mut self) {
        self.move_by(1, true);
    }

    pub fn previous(&mut self) {
        self.move_by(-1, true);
    }

    pub fn page_down(&mut self) {
        self.move_by(20, false);
    }

    pub fn page_up(&mut self) {
        self.move_by(-20, false);
    }

    pub fn first(&mut self) {
        if self.current_len() > 0 {
            self.current_state().select(Some(0));
        }
    }

    pub fn last(&mut self) {
        let len = self.current_len();
        if len > 0 {
            self.current_state().select(Some(len - 1));
        }
    }
}

fn reset_selection(state: &mut TableState, len: usize) {
    state.select(if len == 0 { None } else { Some(0) });
}

fn join_flags(flags: impl Iterator<Item = String>) -> String {
    flags.collect::<Vec<_>>().join(", ")
}

pub fn run_ui(app: &mut App) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, app);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    res.map_err(Into::into)
}

fn run_app<B: ratatui::backend::Backend>(terminal: &mut Terminal<B>, app: &mut App) -> io::Result<()> {
    loop {
        terminal.draw(|f| ui(f, app))?;

        if let Event::Key(key) = event::read()? {
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                KeyCode::Enter => app.toggle_detail(),
                KeyCode::Tab => {
                    if key.modifiers.contains(KeyModifiers::SHIFT) {
                        app.previous_page();
                    } else {
                        app.next_page();
                    }
                }
                KeyCode::BackTab => app.previous_page(),
                KeyCode::Char('1') => app.apply_filter(Some(EntityType::Company)),
                KeyCode::Char('2') => app.apply_filter(Some(EntityType::Fund)),
                KeyCode::Char('3') => app.apply_filter(Some(EntityType::Investor)),
                KeyCode::Char('4') => app.apply_filter(Some(EntityType::Counterparty)),
                KeyCode::Char('0') | KeyCode::Char('c') => app.clear_filter(),
                KeyCode::Down | KeyCode::Char('j') => app.next(),
                KeyCode::Up | KeyCode::Char('k') => app.previous(),
                KeyCode::PageDown => app.page_down(),
                KeyCode::PageUp => app.page_up(),
                KeyCode::Home => app.first(),
                KeyCode::End => app.last(),
                _ => {}
            }
        }
    }
}

fn ui(f: &mut Frame, app: &mut App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header with navigation
            Constraint::Min(0),    // Content area
            Constraint::Length(3), // Status bar
        ])
        .split(f.size());

    render_header(f, chunks[0], app);

    let detail_available = matches!(app.current_page, Page::Entities | Page::Associations);
    let content = if app.show_detail && detail_available {
        let content_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
            .split(chunks[1]);
        render_detail_panel(f, content_chunks[1], app);
        content_chunks[0]
    } else {
        chunks[1]
    };

    match app.current_page {
        Page::Entities => render_entities(f, content, app),
        Page::Associations => render_associations(f, content, app),
        Page::ReviewQueue => render_review(f, content, app),
    }

    render_status_bar(f, chunks[2], app);
}

fn render_header(f: &mut Frame, area: Rect, app: &App) {
    let pages = [Page::Entities, Page::Associations, Page::ReviewQueue];

    let mut tab_spans = vec![];
    for (i, page) in pages.iter().enumerate() {
        if i > 0 {
            tab_spans.push(Span::raw(" │ "));
        }
        let style = if *page == app.current_page {
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD | Modifier::UNDERLINED)
        } else {
            Style::default().fg(Color::DarkGray)
        };
        tab_spans.push(Span::styled(page.title().to_string(), style));
    }

    tab_spans.push(Span::raw("  |  "));
    for (entity_type, count) in app.counts() {
        tab_spans.push(Span::styled(
            format!("{}: {}  ", entity_type.id_prefix(), count),
            Style::default().fg(Color::White),
        ));
    }
    tab_spans.push(Span::styled(
        format!("Review: {}", app.review.len()),
        Style::default().fg(Color::Red),
    ));
    if let Some(run) = &app.run {
        tab_spans.push(Span::raw("  |  "));
        tab_spans.push(Span::styled(
            format!("as of {}", run.as_of),
            Style::default().fg(Color::Cyan),
        ));
    }

    let header = Paragraph::new(vec![Line::from(tab_spans)])
        .block(Block::default().borders(Borders::ALL).border_style(Style::default().fg(Color::Cyan)));

    f.render_widget(header, area);
}

fn header_row(titles: &[&'static str]) -> Row<'static> {
    let cells = titles.iter().map(|h| {
        Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD))
    });
    Row::new(cells).style(Style::default().bg(Color::DarkGray)).height(1)
}

fn rating_color(rating: QualityRating) -> Color {
    match rating {
        QualityRating::Excellent => Color::Green,
        QualityRating::Good => Color::Cyan,
        QualityRating::Fair => Color::Yellow,
        QualityRating::Poor => Color::Red,
    }
}

fn titled_block(title: String) -> Block<'static> {
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::White))
        .title(title)
}

fn highlight() -> Style {
    Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD)
}

fn render_entities(f: &mut Frame, area: Rect, app: &mut App) {
    let rows: Vec<Row> = app
        .entity_rows
        .iter()
        .map(|&i| {
            let e = &app.entities[i];
            let color = rating_color(e.quality_rating);
            Row::new(vec![
                Cell::from(e.id.clone()),
                Cell::from(truncate(e.name().unwrap_or("-"), 28)),
                Cell::from(e.source_coverage.as_str()),
                Cell::from(e.resolution_confidence.as_str()),
                Cell::from(format!("{:.2}", e.completeness_score)),
                Cell::from(e.quality_rating.as_str()).style(Style::default().fg(color)),
                Cell::from(e.data_quality_flag.clone().unwrap_or_default()).style(Style::default().fg(Color::Red)),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(18),
            Constraint::Length(30),
            Constraint::Length(19),
            Constraint::Length(8),
            Constraint::Length(7),
            Constraint::Length(10),
            Constraint::Min(10),
        ],
    )
    .header(header_row(&["Id", "Name", "Coverage", "Conf.", "Compl.", "Rating", "Flag"]))
    .block(titled_block(format!(" Canonical Entities ({}) ", app.entity_rows.len())))
    .highlight_style(highlight())
    .highlight_symbol("→ ");

    f.render_stateful_widget(table, area, &mut app.entity_state);
}

fn render_associations(f: &mut Frame, area: Rect, app: &mut App) {
    let rows: Vec<Row> = app
        .association_rows
        .iter()
        .map(|&i| {
            let a = &app.associations[i];
            Row::new(vec![
                Cell::from(a.association_type.as_str()),
                Cell::from(a.entity_id.clone()),
                Cell::from(truncate(&a.counterpart_id, 20)),
                Cell::from(format!("{:.2}", a.allocation_percentage)),
                Cell::from(if a.is_primary { "★" } else { "" }).style(Style::default().fg(Color::Yellow)),
                Cell::from(a.risk_category.clone()),
                Cell::from(a.significance_category.clone()),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(18),
            Constraint::Length(18),
            Constraint::Length(22),
            Constraint::Length(8),
            Constraint::Length(3),
            Constraint::Length(22),
            Constraint::Min(10),
        ],
    )
    .header(header_row(&["Type", "Entity", "Counterpart", "Alloc%", "P", "Risk", "Significance"]))
    .block(titled_block(format!(" Associations ({}) ", app.association_rows.len())))
    .highlight_style(highlight())
    .highlight_symbol("→ ");

    f.render_stateful_widget(table, area, &mut app.association_state);
}

fn render_review(f: &mut Frame, area: Rect, app: &mut App) {
    let rows: Vec<Row> = app
        .review_rows
        .iter()
        .map(|r| {
            Row::new(vec![
                Cell::from(r.kind).style(Style::default().fg(Color::Magenta)),
                Cell::from(r.entity_type.as_str()),
                Cell::from(r.id.clone()),
                Cell::from(r.reason.clone()).style(Style::default().fg(Color::Red)),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(8),
            Constraint::Length(14),
            Constraint::Length(20),
            Constraint::Min(20),
        ],
    )
    .header(header_row(&["Kind", "Type", "Id", "Reason"]))
    .block(titled_block(format!(" Manual Review ({}) ", app.review_rows.len())))
    .highlight_style(highlight())
    .highlight_symbol("→ ");

    f.render_stateful_widget(table, area, &mut app.review_state);
}

fn label(text: &str) -> Span<'static> {
    Span::styled(
        format!("  {}: ", text),
        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
    )
}

fn field_lines(
    fields: &BTreeMap<String, entity_consolidation::FieldValue>,
    provenance: &BTreeMap<String, String>,
) -> Vec<Line<'static>> {
    fields
        .iter()
        .map(|(name, value)| {
            Line::from(vec![
                Span::styled(format!("  {:<24}", name), Style::default().fg(Color::White)),
                Span::raw(truncate(&value.display_text(), 28)),
                Span::styled(
                    format!("  {}", provenance.get(name).map(String::as_str).unwrap_or("")),
                    Style::default().fg(Color::DarkGray),
                ),
            ])
        })
        .collect()
}

fn render_detail_panel(f: &mut Frame, area: Rect, app: &App) {
    let (title, content) = match app.current_page {
        Page::Entities => match app.selected_entity() {
            Some(e) => (" Entity Details ", entity_detail(e)),
            None => (" Entity Details ", vec![Line::from("No entity selected")]),
        },
        _ => match app.selected_association() {
            Some(a) => (" Association Details ", association_detail(a)),
            None => (" Association Details ", vec![Line::from("No association selected")]),
        },
    };

    let panel = Paragraph::new(content).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Yellow))
            .title(title),
    );
    f.render_widget(panel, area);
}

fn entity_detail(e: &CanonicalEntity) -> Vec<Line<'static>> {
    let mut lines = vec![
        Line::from(vec![label("Id"), Span::raw(e.id.clone())]),
        Line::from(vec![label("Type"), Span::raw(e.entity_type.as_str())]),
        Line::from(vec![
            label("Rating"),
            Span::styled(e.quality_rating.as_str(), Style::default().fg(rating_color(e.quality_rating))),
            Span::raw(format!("  ({:.2}% complete)", e.completeness_score)),
        ]),
        Line::from(vec![label("Sources"), Span::raw(e.source_keys.join(", "))]),
        Line::from(""),
    ];
    lines.extend(field_lines(&e.fields, &e.provenance));
    lines.push(Line::from(""));
    if !e.flags.is_empty() {
        lines.push(Line::from(vec![
            label("Flags"),
            Span::styled(join_flags(e.flags.iter().map(|f| f.to_string())), Style::default().fg(Color::Red)),
        ]));
    }
    lines.push(Line::from(vec![label("Hash"), Span::raw(truncate(&e.content_hash, 24))]));
    lines
}

fn association_detail(a: &AssociationRecord) -> Vec<Line<'static>> {
    let mut lines = vec![
        Line::from(vec![label("Edge"), Span::raw(a.edge_key())]),
        Line::from(vec![label("Type"), Span::raw(a.association_type.as_str())]),
        Line::from(vec![label("Risk"), Span::raw(a.risk_category.clone())]),
        Line::from(vec![label("Significance"), Span::raw(a.significance_category.clone())]),
        Line::from(""),
    ];
    lines.extend(field_lines(&a.fields, &a.provenance));
    lines.push(Line::from(""));
    if !a.flags.is_empty() {
        lines.push(Line::from(vec![
            label("Flags"),
            Span::styled(join_flags(a.flags.iter().map(|f| f.to_string())), Style::default().fg(Color::Red)),
        ]));
    }
    lines.push(Line::from(vec![label("Hash"), Span::raw(truncate(&a.content_hash, 24))]));
    lines
}

fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let (selected, total) = match app.current_page {
        Page::Entities => (app.entity_state.selected(), app.entity_rows.len()),
        Page::Associations => (app.association_state.selected(), app.association_rows.len()),
        Page::ReviewQueue => (app.review_state.selected(), app.review_rows.len()),
    };
    let selected = selected.map(|i| i + 1).unwrap_or(0);

    let mut status_spans = vec![Span::styled(
        format!(" Row: {}/{} ", selected, total),
        Style::default().fg(Color::Cyan),
    )];

    if let Some(filter) = app.filter {
        status_spans.push(Span::raw(" | "));
        status_spans.push(Span::styled(
            format!("Filter: {}", filter.as_str()),
            Style::default().fg(Color::Green),
        ));
        status_spans.push(Span::raw(" ("));
        status_spans.push(Span::styled("0", Style::default().fg(Color::Yellow)));
        status_spans.push(Span::raw(" clear)"));
    }

    for (key, text) in [
        ("1-4", " Type | "),
        ("Enter", " Details | "),
        ("Tab", " Page | "),
        ("↑/↓", " Nav | "),
        ("q", " Quit"),
    ] {
        status_spans.push(Span::styled(key, Style::default().fg(Color::Yellow)));
        status_spans.push(Span::raw(text));
    }

    let status_bar = Paragraph::new(Line::from(status_spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White)),
    );
    f.render_widget(status_bar, area);
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() > max_len {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        s.to_string()
    }
}

//! Parser for the ASCII tables emitted by platform and OpenStack CLIs
//!
//! Turns `+---+`-framed output from `system host-list`, `fm alarm-list`,
//! `openstack server list` and friends into queryable rows, including the
//! two-column Property/Value variant from `*-show` commands. The dispatcher
//! never parses output itself; everything flows through here.
//!
//! Filters are an explicit map of column → expectation plus an options
//! struct. `Match::Not` inverts a single expectation.

use regex::RegexBuilder;

use crate::error::{Error, Result};

/// A parsed CLI table: ordered headers plus one `Vec<String>` per logical row.
///
/// Invariant: every row has exactly `headers.len()` cells. Multi-line cells
/// keep their embedded newlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    /// Column names in display order
    pub headers: Vec<String>,
    /// Row cells, aligned to `headers`
    pub values: Vec<Vec<String>>,
}

/// Parse options
#[derive(Debug, Clone, Copy)]
pub struct ParseOpts {
    /// Rejoin continuation lines into their logical row with `\n`.
    /// When false every physical line becomes its own row.
    pub combine_multiline: bool,
}

impl Default for ParseOpts {
    fn default() -> Self {
        Self {
            combine_multiline: true,
        }
    }
}

/// One filter expectation for a column
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    /// Cell must match the value (per [`FilterOpts`])
    Is(String),
    /// Cell must NOT match the value
    Not(String),
}

impl Match {
    pub fn is(v: impl Into<String>) -> Self {
        Match::Is(v.into())
    }

    pub fn not(v: impl Into<String>) -> Self {
        Match::Not(v.into())
    }

    fn expected(&self) -> &str {
        match self {
            Match::Is(v) | Match::Not(v) => v,
        }
    }

    fn negated(&self) -> bool {
        matches!(self, Match::Not(_))
    }
}

/// Options applied to every expectation in one `filter` call
#[derive(Debug, Clone, Copy)]
pub struct FilterOpts {
    /// true: whole-cell equality. false: case-insensitive substring.
    pub strict: bool,
    /// Treat expectations as regular expressions (strict is ignored)
    pub regex: bool,
}

impl Default for FilterOpts {
    fn default() -> Self {
        Self {
            strict: true,
            regex: false,
        }
    }
}

impl FilterOpts {
    /// Case-insensitive substring matching
    pub fn loose() -> Self {
        Self {
            strict: false,
            regex: false,
        }
    }
}

impl Table {
    /// Index of `header`, case-insensitive on the header name
    fn col_index(&self, header: &str) -> Result<usize> {
        self.headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(header))
            .ok_or_else(|| {
                Error::no_match(format!(
                    "column '{}' (have: {})",
                    header,
                    self.headers.join(", ")
                ))
            })
    }

    /// All values of one column, in row order
    pub fn column(&self, header: &str) -> Result<Vec<String>> {
        let idx = self.col_index(header)?;
        Ok(self.values.iter().map(|row| row[idx].clone()).collect())
    }

    /// Rows matching every expectation in `filters`
    pub fn filter(&self, filters: &[(&str, Match)], opts: FilterOpts) -> Result<Table> {
        let mut compiled = Vec::with_capacity(filters.len());
        for (header, m) in filters {
            compiled.push((self.col_index(header)?, m));
        }
        let mut values = Vec::new();
        for row in &self.values {
            let mut keep = true;
            for (idx, m) in &compiled {
                let hit = cell_matches(&row[*idx], m.expected(), opts)?;
                if hit == m.negated() {
                    keep = false;
                    break;
                }
            }
            if keep {
                values.push(row.clone());
            }
        }
        Ok(Table {
            headers: self.headers.clone(),
            values,
        })
    }

    /// Filter then project one column
    pub fn values_with(
        &self,
        header: &str,
        filters: &[(&str, Match)],
        opts: FilterOpts,
    ) -> Result<Vec<String>> {
        self.filter(filters, opts)?.column(header)
    }

    /// The unique value for `key` in a two-column Property/Value table
    pub fn value_two_col(&self, key: &str) -> Result<String> {
        if self.headers.len() != 2 {
            return Err(Error::table(format!(
                "expected a two-column table, got {} columns",
                self.headers.len()
            )));
        }
        let mut found = None;
        for row in &self.values {
            if row[0] == key {
                if found.is_some() {
                    return Err(Error::table(format!("duplicate key '{}'", key)));
                }
                found = Some(row[1].clone());
            }
        }
        found.ok_or_else(|| Error::no_match(format!("key '{}'", key)))
    }

    /// Values for several keys of a two-column table, in the order given
    pub fn multi_values_two_col(&self, keys: &[&str]) -> Result<Vec<String>> {
        keys.iter().map(|k| self.value_two_col(k)).collect()
    }

    /// Render back to the CLI frame. `parse(render(t)) == t` for any table
    /// whose cells carry no leading/trailing whitespace.
    pub fn render(&self) -> String {
        let ncols = self.headers.len();
        // Physical lines per cell, column widths over all of them.
        let split: Vec<Vec<Vec<&str>>> = self
            .values
            .iter()
            .map(|row| row.iter().map(|c| c.split('\n').collect()).collect())
            .collect();
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.len()).collect();
        for row in &split {
            for (i, cell) in row.iter().enumerate() {
                for line in cell {
                    widths[i] = widths[i].max(line.len());
                }
            }
        }

        let sep: String = {
            let mut s = String::from("+");
            for w in &widths {
                s.push_str(&"-".repeat(w + 2));
                s.push('+');
            }
            s
        };
        let fmt_line = |cells: &[&str]| {
            let mut s = String::from("|");
            for i in 0..ncols {
                let text = cells.get(i).copied().unwrap_or("");
                s.push_str(&format!(" {:<1$} |", text, widths[i]));
            }
            s
        };

        let mut out = String::new();
        out.push_str(&sep);
        out.push('\n');
        let header_refs: Vec<&str> = self.headers.iter().map(String::as_str).collect();
        out.push_str(&fmt_line(&header_refs));
        out.push('\n');
        out.push_str(&sep);
        out.push('\n');
        for row in &split {
            let height = row.iter().map(Vec::len).max().unwrap_or(1);
            for line_no in 0..height {
                let cells: Vec<&str> = row
                    .iter()
                    .map(|cell| cell.get(line_no).copied().unwrap_or(""))
                    .collect();
                out.push_str(&fmt_line(&cells));
                out.push('\n');
            }
        }
        out.push_str(&sep);
        out.push('\n');
        out
    }
}

fn cell_matches(cell: &str, expected: &str, opts: FilterOpts) -> Result<bool> {
    if opts.regex {
        let re = RegexBuilder::new(expected)
            .case_insensitive(!opts.strict)
            .build()?;
        return Ok(re.is_match(cell));
    }
    if opts.strict {
        Ok(cell == expected)
    } else {
        Ok(cell.to_lowercase().contains(&expected.to_lowercase()))
    }
}

fn is_separator(line: &str) -> bool {
    let t = line.trim();
    t.len() >= 2
        && t.starts_with('+')
        && t.ends_with('+')
        && t.chars().all(|c| c == '+' || c == '-')
}

fn split_row(line: &str, ncols: usize) -> Result<Vec<String>> {
    let t = line.trim();
    if !t.starts_with('|') || !t.ends_with('|') {
        return Err(Error::table(format!("row not framed by '|': {:?}", line)));
    }
    let cells: Vec<String> = t[1..t.len() - 1]
        .split('|')
        .map(|c| c.trim().to_string())
        .collect();
    if cells.len() != ncols {
        return Err(Error::table(format!(
            "ragged row: {} cells, expected {}: {:?}",
            cells.len(),
            ncols,
            line
        )));
    }
    Ok(cells)
}

/// Parse CLI output containing one framed table, with default options.
pub fn parse_table(text: &str) -> Result<Table> {
    parse_table_with(text, ParseOpts::default())
}

/// Parse CLI output containing one framed table.
///
/// Lines before the first `+---+` separator and after the closing one are
/// ignored (CLIs print warnings around their tables). A table needs at
/// least three separators: top, header, bottom.
pub fn parse_table_with(text: &str, opts: ParseOpts) -> Result<Table> {
    let lines: Vec<&str> = text.lines().collect();
    let sep_idx: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| is_separator(l))
        .map(|(i, _)| i)
        .collect();
    if sep_idx.len() < 3 {
        return Err(Error::table(format!(
            "need top/header/bottom separators, found {}",
            sep_idx.len()
        )));
    }
    let (top, header_sep, bottom) = (sep_idx[0], sep_idx[1], *sep_idx.last().unwrap());

    // Header may wrap onto several physical lines; join with a space.
    let mut headers: Vec<String> = Vec::new();
    for line in &lines[top + 1..header_sep] {
        let cells: Vec<String> = {
            let t = line.trim();
            if !t.starts_with('|') || !t.ends_with('|') {
                return Err(Error::table(format!("header row not framed: {:?}", line)));
            }
            t[1..t.len() - 1]
                .split('|')
                .map(|c| c.trim().to_string())
                .collect()
        };
        if headers.is_empty() {
            headers = cells;
        } else if cells.len() == headers.len() {
            for (h, extra) in headers.iter_mut().zip(cells) {
                if !extra.is_empty() {
                    h.push(' ');
                    h.push_str(&extra);
                }
            }
        } else {
            return Err(Error::table("ragged header continuation".to_string()));
        }
    }
    if headers.is_empty() {
        return Err(Error::table("empty header section".to_string()));
    }
    let ncols = headers.len();

    let mut values: Vec<Vec<String>> = Vec::new();
    for line in &lines[header_sep + 1..bottom] {
        if is_separator(line) {
            // Inner separators (some CLIs frame every row) carry no data.
            continue;
        }
        let cells = split_row(line, ncols)?;
        // A continuation line has an empty first cell and belongs to the
        // previous logical row.
        let is_continuation = !values.is_empty() && cells[0].is_empty();
        if opts.combine_multiline && is_continuation {
            let prev = values.last_mut().unwrap();
            for (i, cell) in cells.into_iter().enumerate() {
                if !cell.is_empty() {
                    prev[i].push('\n');
                    prev[i].push_str(&cell);
                }
            }
        } else {
            values.push(cells);
        }
    }

    Ok(Table { headers, values })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_LIST: &str = "\
+----+--------------+-------------+----------------+-------------+--------------+
| id | hostname     | personality | administrative | operational | availability |
+----+--------------+-------------+----------------+-------------+--------------+
| 1  | controller-0 | controller  | unlocked       | enabled     | available    |
| 2  | controller-1 | controller  | unlocked       | enabled     | available    |
| 3  | compute-0    | worker      | locked         | disabled    | online       |
| 4  | compute-1    | worker      | unlocked       | enabled     | degraded     |
+----+--------------+-------------+----------------+-------------+--------------+
";

    const HOST_SHOW: &str = "\
+-----------------+--------------+
| Property        | Value        |
+-----------------+--------------+
| hostname        | controller-0 |
| administrative  | unlocked     |
| operational     | enabled      |
| availability    | available    |
+-----------------+--------------+
";

    const ALARM_LIST_MULTILINE: &str = "\
Some CLI preamble to ignore
+----------+----------------------------------------+--------------------+----------+
| Alarm ID | Reason Text                            | Entity ID          | Severity |
+----------+----------------------------------------+--------------------+----------+
| 200.001  | compute-0 was administratively locked  | host=compute-0     | warning  |
|          | to take it out-of-service.             |                    |          |
| 400.002  | Service group controller-services loss | service_domain=con | major    |
|          | of redundancy                          | troller            |          |
+----------+----------------------------------------+--------------------+----------+
";

    #[test]
    fn parses_host_list() {
        let t = parse_table(HOST_LIST).unwrap();
        assert_eq!(t.headers[1], "hostname");
        assert_eq!(t.values.len(), 4);
        assert_eq!(
            t.column("hostname").unwrap(),
            vec!["controller-0", "controller-1", "compute-0", "compute-1"]
        );
    }

    #[test]
    fn multiline_cells_rejoin_with_newlines() {
        let t = parse_table(ALARM_LIST_MULTILINE).unwrap();
        assert_eq!(t.values.len(), 2);
        assert_eq!(
            t.values[0][1],
            "compute-0 was administratively locked\nto take it out-of-service."
        );
        // The entity cell of the second alarm wrapped mid-word.
        assert_eq!(t.values[1][2], "service_domain=con\ntroller");
    }

    #[test]
    fn multiline_disabled_keeps_physical_rows() {
        let t = parse_table_with(
            ALARM_LIST_MULTILINE,
            ParseOpts {
                combine_multiline: false,
            },
        )
        .unwrap();
        assert_eq!(t.values.len(), 4);
        assert_eq!(t.values[1][0], "");
    }

    #[test]
    fn two_col_table_lookups() {
        let t = parse_table(HOST_SHOW).unwrap();
        assert_eq!(t.value_two_col("hostname").unwrap(), "controller-0");
        assert_eq!(
            t.multi_values_two_col(&["administrative", "operational", "availability"])
                .unwrap(),
            vec!["unlocked", "enabled", "available"]
        );
        assert!(matches!(
            t.value_two_col("uptime"),
            Err(Error::NoMatch { .. })
        ));
    }

    #[test]
    fn two_col_lookup_rejects_wide_tables() {
        let t = parse_table(HOST_LIST).unwrap();
        assert!(matches!(
            t.value_two_col("hostname"),
            Err(Error::InvalidTableStructure { .. })
        ));
    }

    #[test]
    fn strict_and_loose_filtering() {
        let t = parse_table(HOST_LIST).unwrap();
        let strict = t
            .filter(
                &[("administrative", Match::is("unlocked"))],
                FilterOpts::default(),
            )
            .unwrap();
        assert_eq!(strict.values.len(), 3);

        // Loose matching is case-insensitive substring.
        let loose = t
            .filter(&[("hostname", Match::is("CONTROLLER"))], FilterOpts::loose())
            .unwrap();
        assert_eq!(loose.values.len(), 2);
    }

    #[test]
    fn negated_filter() {
        let t = parse_table(HOST_LIST).unwrap();
        let rows = t
            .filter(
                &[("availability", Match::not("available"))],
                FilterOpts::default(),
            )
            .unwrap();
        assert_eq!(rows.column("hostname").unwrap(), vec!["compute-0", "compute-1"]);
    }

    #[test]
    fn regex_filter() {
        let t = parse_table(HOST_LIST).unwrap();
        let rows = t
            .filter(
                &[("hostname", Match::is(r"^compute-\d$"))],
                FilterOpts {
                    strict: true,
                    regex: true,
                },
            )
            .unwrap();
        assert_eq!(rows.values.len(), 2);
    }

    /// Law: filter(filter(T, a), b) == filter(T, a + b)
    #[test]
    fn filter_composition() {
        let t = parse_table(HOST_LIST).unwrap();
        let opts = FilterOpts::default();
        let chained = t
            .filter(&[("administrative", Match::is("unlocked"))], opts)
            .unwrap()
            .filter(&[("availability", Match::is("available"))], opts)
            .unwrap();
        let combined = t
            .filter(
                &[
                    ("administrative", Match::is("unlocked")),
                    ("availability", Match::is("available")),
                ],
                opts,
            )
            .unwrap();
        assert_eq!(chained, combined);
    }

    /// Law: every projected value of a strictly filtered column equals the
    /// filter value.
    #[test]
    fn projection_law() {
        let t = parse_table(HOST_LIST).unwrap();
        let vals = t
            .values_with(
                "personality",
                &[("personality", Match::is("worker"))],
                FilterOpts::default(),
            )
            .unwrap();
        assert!(!vals.is_empty());
        assert!(vals.iter().all(|v| v == "worker"));
    }

    /// Law: parse(render(parse(T))) == parse(T), multi-line cells included.
    #[test]
    fn render_parse_round_trip() {
        for text in [HOST_LIST, HOST_SHOW, ALARM_LIST_MULTILINE] {
            let t = parse_table(text).unwrap();
            let again = parse_table(&t.render()).unwrap();
            assert_eq!(t, again);
        }
    }

    #[test]
    fn malformed_tables_are_rejected() {
        assert!(matches!(
            parse_table("no table here at all"),
            Err(Error::InvalidTableStructure { .. })
        ));
        let ragged = "\
+----+------+
| id | name |
+----+------+
| 1  | a    | extra |
+----+------+
";
        assert!(matches!(
            parse_table(ragged),
            Err(Error::InvalidTableStructure { .. })
        ));
    }

    #[test]
    fn unknown_filter_column_lists_known_headers() {
        let t = parse_table(HOST_LIST).unwrap();
        let err = t
            .filter(&[("flavor", Match::is("x"))], FilterOpts::default())
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("flavor"));
        assert!(msg.contains("hostname"));
    }
}

use clap::ValueEnum;
use colored::Colorize;
use kopsflow_core::{Cluster, InstanceGroup, codec};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Yaml,
    Json,
    Plaintext,
}

/// Column-aligned listing in the style of the other commands
pub struct Table {
    headers: Vec<&'static str>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &[&'static str]) -> Self {
        Self {
            headers: headers.to_vec(),
            rows: Vec::new(),
        }
    }

    pub fn row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn widths(&self) -> Vec<usize> {
        self.headers
            .iter()
            .enumerate()
            .map(|(i, h)| {
                self.rows
                    .iter()
                    .filter_map(|r| r.get(i))
                    .map(|c| c.chars().count())
                    .chain(std::iter::once(h.len()))
                    .max()
                    .unwrap_or_default()
            })
            .collect()
    }

    pub fn print(&self) {
        let widths = self.widths();
        let line = |cells: Vec<&str>| {
            cells
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:<w$}", c, w = *w))
                .collect::<Vec<_>>()
                .join("  ")
                .trim_end()
                .to_string()
        };
        println!("{}", line(self.headers.clone()).bold());
        let total = widths.iter().sum::<usize>() + 2 * widths.len().saturating_sub(1);
        println!("{}", "─".repeat(total).dimmed());
        for row in &self.rows {
            println!("{}", line(row.iter().map(String::as_str).collect()));
        }
    }
}

/// Print structured output as YAML or JSON; tables are handled by callers
pub fn print_structured<T: Serialize>(value: &T, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        _ => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

/// Print API objects as a YAML stream or a JSON list
pub fn print_objects(
    clusters: &[Cluster],
    instance_groups: &[InstanceGroup],
    format: OutputFormat,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            let mut docs: Vec<serde_json::Value> = Vec::new();
            for cluster in clusters {
                docs.push(serde_json::from_str(&codec::encode_json(cluster)?)?);
            }
            for ig in instance_groups {
                docs.push(serde_json::from_str(&codec::encode_json(ig)?)?);
            }
            println!("{}", serde_json::to_string_pretty(&docs)?);
        }
        _ => {
            let mut docs = Vec::new();
            for cluster in clusters {
                docs.push(String::from_utf8(codec::encode(cluster)?)?);
            }
            for ig in instance_groups {
                docs.push(String::from_utf8(codec::encode(ig)?)?);
            }
            print!("{}", docs.join("---\n"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widths_cover_headers_and_cells() {
        let mut table = Table::new(&["NAME", "ROLE"]);
        table.row(vec!["master-us-test-1a".into(), "ControlPlane".into()]);
        table.row(vec!["nodes".into(), "Node".into()]);
        assert_eq!(table.widths(), vec![17, 12]);
        assert!(!table.is_empty());
    }
}

//! Terraform target
//!
//! Tasks add resource blocks instead of calling the cloud. `finish` writes a
//! single `kubernetes.tf` plus a `data/` directory holding large literals
//! (launch template user data) referenced by file name. Blocks and attributes
//! are sorted, so identical inputs give byte-identical output.

use crate::error::{FiError, Result};
use crate::task::{TaskKey, TaskRef};
use crate::tasks::types;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs;

pub const MAIN_FILE: &str = "kubernetes.tf";
pub const DATA_DIR: &str = "data";

/// Value of an HCL attribute
#[derive(Debug, Clone, PartialEq)]
pub enum HclValue {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<HclValue>),
    Map(BTreeMap<String, HclValue>),
    /// Nested blocks, rendered as repeated `name { ... }`
    Blocks(Vec<BTreeMap<String, HclValue>>),
    /// Raw expression such as `aws_vpc.main.id`
    Expr(String),
}

impl HclValue {
    pub fn str(s: impl Into<String>) -> Self {
        HclValue::Str(s.into())
    }

    pub fn tags(tags: &BTreeMap<String, String>) -> Self {
        HclValue::Map(
            tags.iter()
                .map(|(k, v)| (k.clone(), HclValue::Str(v.clone())))
                .collect(),
        )
    }
}

/// Terraform resource type for a task type
pub fn resource_type(task_type: &str) -> Option<&'static str> {
    Some(match task_type {
        types::VPC => "aws_vpc",
        types::SUBNET => "aws_subnet",
        types::INTERNET_GATEWAY => "aws_internet_gateway",
        types::ROUTE_TABLE => "aws_route_table",
        types::SECURITY_GROUP => "aws_security_group",
        types::SECURITY_GROUP_RULE => "aws_security_group_rule",
        types::SSH_KEY => "aws_key_pair",
        types::LAUNCH_TEMPLATE => "aws_launch_template",
        types::AUTOSCALING_GROUP => "aws_autoscaling_group",
        _ => return None,
    })
}

/// Resource label for a task name (`nodes.example.com` -> `nodes-example-com`)
pub fn label(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .collect()
}

#[derive(Default)]
struct Module {
    resources: BTreeMap<(String, String), BTreeMap<String, HclValue>>,
    data_files: BTreeMap<String, String>,
    literals: HashMap<TaskKey, String>,
    outputs: BTreeMap<String, HclValue>,
}

pub struct TerraformTarget {
    cluster_name: String,
    region: String,
    out_dir: PathBuf,
    module: Mutex<Module>,
}

impl TerraformTarget {
    pub fn new(cluster_name: impl Into<String>, region: impl Into<String>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            region: region.into(),
            out_dir: out_dir.into(),
            module: Mutex::new(Module::default()),
        }
    }

    fn module(&self) -> std::sync::MutexGuard<'_, Module> {
        self.module.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a resource block; returns the expression for its id
    pub fn add_resource(
        &self,
        resource_type: &str,
        name: &str,
        attributes: BTreeMap<String, HclValue>,
    ) -> HclValue {
        let label = label(name);
        let id = HclValue::Expr(format!("{resource_type}.{label}.id"));
        self.module()
            .resources
            .insert((resource_type.to_string(), label), attributes);
        id
    }

    /// Store `contents` under `data/` and return an expression reading it
    /// base64-encoded
    pub fn add_data_file(&self, resource_type: &str, name: &str, field: &str, contents: &str) -> HclValue {
        let file = format!("{resource_type}_{name}_{field}");
        let expr = format!("filebase64(\"${{path.module}}/{DATA_DIR}/{file}\")");
        self.module().data_files.insert(file, contents.to_string());
        HclValue::Expr(expr)
    }

    /// A shared resource is referenced by its literal id
    pub fn register_literal(&self, key: TaskKey, id: impl Into<String>) {
        self.module().literals.insert(key, id.into());
    }

    pub fn add_output(&self, name: &str, value: HclValue) {
        self.module().outputs.insert(name.to_string(), value);
    }

    /// Expression for `attribute` of the referenced task's resource
    pub fn link(&self, r: &TaskRef, attribute: &str) -> Result<HclValue> {
        if let Some(id) = self.module().literals.get(r.key()) {
            return Ok(HclValue::Str(id.clone()));
        }
        let resource_type = resource_type(&r.key().type_name).ok_or_else(|| FiError::UnsupportedTarget {
            key: r.key().clone(),
            target: "terraform".into(),
        })?;
        Ok(HclValue::Expr(format!(
            "{}.{}.{}",
            resource_type,
            label(&r.key().name),
            attribute
        )))
    }

    /// Render `kubernetes.tf`
    pub fn render(&self) -> String {
        let module = self.module();
        let mut out = String::new();

        let locals = BTreeMap::from([
            ("cluster_name".to_string(), HclValue::str(&self.cluster_name)),
            ("region".to_string(), HclValue::str(&self.region)),
        ]);
        write_block(&mut out, "locals", &locals);

        let mut outputs = module.outputs.clone();
        outputs.insert("cluster_name".into(), HclValue::str(&self.cluster_name));
        outputs.insert("region".into(), HclValue::str(&self.region));
        for (name, value) in &outputs {
            let body = BTreeMap::from([("value".to_string(), value.clone())]);
            write_block(&mut out, &format!("output \"{name}\""), &body);
        }

        let provider = BTreeMap::from([("region".to_string(), HclValue::str(&self.region))]);
        write_block(&mut out, "provider \"aws\"", &provider);

        for ((resource_type, label), attributes) in &module.resources {
            write_block(&mut out, &format!("resource \"{resource_type}\" \"{label}\""), attributes);
        }

        let aws = BTreeMap::from([
            ("source".to_string(), HclValue::str("hashicorp/aws")),
            ("version".to_string(), HclValue::str(">= 5.0.0")),
        ]);
        let providers = BTreeMap::from([("aws".to_string(), HclValue::Map(aws))]);
        let terraform = BTreeMap::from([
            ("required_version".to_string(), HclValue::str(">= 0.15.0")),
            ("required_providers".to_string(), HclValue::Blocks(vec![providers])),
        ]);
        out.push_str("terraform {\n");
        write_body(&mut out, &terraform, 1);
        out.push_str("}\n");

        out
    }

    /// Write `kubernetes.tf` and the data files
    pub async fn finish(&self) -> Result<Vec<PathBuf>> {
        let rendered = self.render();
        let data_files = self.module().data_files.clone();

        fs::create_dir_all(&self.out_dir).await?;
        let mut written = Vec::new();

        let main = self.out_dir.join(MAIN_FILE);
        fs::write(&main, rendered).await?;
        written.push(main);

        if !data_files.is_empty() {
            let data_dir = self.out_dir.join(DATA_DIR);
            fs::create_dir_all(&data_dir).await?;
            for (name, contents) in data_files {
                let path = data_dir.join(name);
                fs::write(&path, contents).await?;
                written.push(path);
            }
        }

        tracing::info!("Terraform output is in {}", self.out_dir.display());
        Ok(written)
    }
}

fn write_block(out: &mut String, header: &str, body: &BTreeMap<String, HclValue>) {
    let _ = writeln!(out, "{header} {{");
    write_body(out, body, 1);
    out.push_str("}\n\n");
}

fn write_body(out: &mut String, body: &BTreeMap<String, HclValue>, depth: usize) {
    let indent = "  ".repeat(depth);
    let width = body
        .iter()
        .filter(|(_, v)| !matches!(v, HclValue::Blocks(_)))
        .map(|(k, _)| k.len())
        .max()
        .unwrap_or(0);

    for (key, value) in body {
        if matches!(value, HclValue::Blocks(_)) {
            continue;
        }
        let _ = write!(out, "{indent}{key:<width$} = ");
        write_value(out, value, depth);
        out.push('\n');
    }

    for (key, value) in body {
        if let HclValue::Blocks(blocks) = value {
            for block in blocks {
                let _ = writeln!(out, "{indent}{key} {{");
                write_body(out, block, depth + 1);
                let _ = writeln!(out, "{indent}}}");
            }
        }
    }
}

fn write_value(out: &mut String, value: &HclValue, depth: usize) {
    match value {
        HclValue::Str(s) => {
            let _ = write!(out, "\"{}\"", escape(s));
        }
        HclValue::Int(i) => {
            let _ = write!(out, "{i}");
        }
        HclValue::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        HclValue::Expr(e) => out.push_str(e),
        HclValue::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, item, depth);
            }
            out.push(']');
        }
        HclValue::Map(map) => {
            if map.is_empty() {
                out.push_str("{}");
                return;
            }
            let indent = "  ".repeat(depth + 1);
            let width = map.keys().map(|k| k.len() + 2).max().unwrap_or(0);
            out.push_str("{\n");
            for (key, item) in map {
                let quoted = format!("\"{}\"", escape(key));
                let _ = write!(out, "{indent}{quoted:<width$} = ");
                write_value(out, item, depth + 1);
                out.push('\n');
            }
            let _ = write!(out, "{}}}", "  ".repeat(depth));
        }
        HclValue::Blocks(_) => {}
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace("${", "$${")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(dir: &std::path::Path) -> TerraformTarget {
        TerraformTarget::new("minimal.example.com", "us-test-1", dir)
    }

    #[test]
    fn test_render_is_sorted_and_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let tf = target(dir.path());
        let id = tf.add_resource(
            "aws_vpc",
            "minimal.example.com",
            BTreeMap::from([
                ("enable_dns_hostnames".to_string(), HclValue::Bool(true)),
                ("cidr_block".to_string(), HclValue::str("172.20.0.0/16")),
                (
                    "tags".to_string(),
                    HclValue::tags(&BTreeMap::from([("Name".to_string(), "minimal.example.com".to_string())])),
                ),
            ]),
        );
        assert_eq!(id, HclValue::Expr("aws_vpc.minimal-example-com.id".into()));

        let rendered = tf.render();
        assert!(rendered.contains(
            "resource \"aws_vpc\" \"minimal-example-com\" {\n  cidr_block           = \"172.20.0.0/16\"\n  enable_dns_hostnames = true\n"
        ));
        assert!(rendered.contains("    \"Name\" = \"minimal.example.com\"\n"));
        assert!(rendered.starts_with("locals {\n"));
        assert!(rendered.contains("required_providers {\n    aws = {\n"));
    }

    #[test]
    fn test_link_prefers_literal() {
        let dir = tempfile::tempdir().unwrap();
        let tf = target(dir.path());
        let shared = TaskRef::new(types::VPC, "minimal.example.com");
        assert_eq!(
            tf.link(&shared, "id").unwrap(),
            HclValue::Expr("aws_vpc.minimal-example-com.id".into())
        );
        tf.register_literal(shared.key().clone(), "vpc-12345678");
        assert_eq!(tf.link(&shared, "id").unwrap(), HclValue::str("vpc-12345678"));
    }

    #[test]
    fn test_escape_interpolation() {
        assert_eq!(escape("a \"b\" ${c}\n"), "a \\\"b\\\" $${c}\\n");
    }

    #[tokio::test]
    async fn test_finish_writes_data_files() {
        let dir = tempfile::tempdir().unwrap();
        let tf = target(dir.path());
        let expr = tf.add_data_file(
            "aws_launch_template",
            "nodes.minimal.example.com",
            "user_data",
            "#!/bin/bash\n",
        );
        assert_eq!(
            expr,
            HclValue::Expr(
                "filebase64(\"${path.module}/data/aws_launch_template_nodes.minimal.example.com_user_data\")".into()
            )
        );

        let written = tf.finish().await.unwrap();
        assert_eq!(written.len(), 2);
        let data = std::fs::read_to_string(
            dir.path().join("data/aws_launch_template_nodes.minimal.example.com_user_data"),
        )
        .unwrap();
        assert_eq!(data, "#!/bin/bash\n");
    }
}

use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use leaf_certificates::NodeCertificate;
use leaf_core::config::panel_combination_from_env_value;
use leaf_core::model::QueryDefinition;
use leaf_core::resolver::federate;
use leaf_core::shrine::ShrineQueryConverter;
use leaf_core::wire::v1::QueryDefinitionDto;
use leaf_core::{
    dialect_for, Catalog, CompiledQuery, CompilerOptions, LeafError, LeafResult, PanelCompiler,
    Resolution, Resolver, SessionType, SqlDialectKind, UserContext,
};

#[derive(Parser)]
#[command(name = "leaf")]
#[command(about = "Leaf cohort query tooling")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a query to SQL without running it
    Compile {
        /// Query definition (JSON)
        query: PathBuf,
        /// Concept catalog (YAML)
        #[arg(long)]
        catalog: PathBuf,
        /// Target dialect: tsql, mysql, mariadb, plsql, postgresql, bigquery or sqlite
        #[arg(long, default_value = "tsql")]
        dialect: String,
        /// Panel combination: exists or set-operations
        #[arg(long)]
        combination: Option<String>,
        /// Compile for a quality improvement session
        #[arg(long)]
        qi: bool,
        /// Role held by the user (repeatable)
        #[arg(long = "role")]
        roles: Vec<String>,
    },
    /// Convert a query to SHRINE JSON
    Shrine {
        /// Query definition (JSON)
        query: PathBuf,
        /// Concept catalog (YAML)
        #[arg(long)]
        catalog: PathBuf,
        /// SHRINE id of this node
        #[arg(long, default_value_t = 0)]
        node_id: i64,
        /// SHRINE id of the researcher
        #[arg(long, default_value_t = 0)]
        researcher_id: i64,
    },
    /// Generate a node certificate and private key
    Certificate {
        /// Node display name
        name: String,
        /// Token issuer of the node
        issuer: String,
        /// Key id peers look the certificate up by
        key_id: String,
        /// Validity in days
        #[arg(long, default_value_t = 365)]
        days: i64,
        /// Directory to write node.crt and node.key into (prints to stdout if omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Compile {
            query,
            catalog,
            dialect,
            combination,
            qi,
            roles,
        }) => {
            let session_type = if qi {
                SessionType::QualityImprovement
            } else {
                SessionType::Research
            };
            let mut user = UserContext::builder("cli", "local")
                .identified(true, true)
                .session_type(session_type);
            for role in roles {
                user = user.role(role);
            }
            let options = CompilerOptions {
                combination: panel_combination_from_env_value(combination)?,
                ..CompilerOptions::default()
            };

            match compile(
                &Catalog::load(&catalog)?,
                &read_query(&query)?,
                dialect.parse::<SqlDialectKind>()?,
                options,
                &user.build(),
            )
            .await
            {
                Ok(compiled) => println!("{}", compiled.script()),
                Err(e) => eprintln!("Error compiling query: {}", e),
            }
        }
        Some(Commands::Shrine {
            query,
            catalog,
            node_id,
            researcher_id,
        }) => {
            let user = UserContext::builder("cli", "local").build();
            match to_shrine_json(
                &Catalog::load(&catalog)?,
                &read_query(&query)?,
                &user,
                ShrineQueryConverter::new(node_id, researcher_id),
            )
            .await
            {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("Error converting query: {}", e),
            }
        }
        Some(Commands::Certificate {
            name,
            issuer,
            key_id,
            days,
            out,
        }) => match NodeCertificate::create(&name, &issuer, &key_id, days) {
            Ok((cert, key)) => match out {
                Some(dir) => {
                    std::fs::create_dir_all(&dir)?;
                    std::fs::write(dir.join("node.crt"), cert)?;
                    std::fs::write(dir.join("node.key"), key)?;
                    println!("Wrote node.crt and node.key to {}", dir.display());
                }
                None => println!("{}{}", cert, key),
            },
            Err(e) => eprintln!("Error creating certificate: {}", e),
        },
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}

fn read_query(path: &Path) -> LeafResult<QueryDefinition> {
    let text = std::fs::read_to_string(path).map_err(LeafError::FileRead)?;
    parse_query(&text)
}

fn parse_query(text: &str) -> LeafResult<QueryDefinition> {
    let dto: QueryDefinitionDto =
        serde_json::from_str(text).map_err(LeafError::Deserialization)?;
    QueryDefinition::try_from(dto)
}

async fn resolve(
    catalog: &Catalog,
    definition: &QueryDefinition,
    user: &UserContext,
) -> LeafResult<Resolution> {
    Resolver::new(Arc::new(catalog.concept_store()))
        .resolve(user, definition.clone())
        .await
}

async fn compile(
    catalog: &Catalog,
    definition: &QueryDefinition,
    dialect: SqlDialectKind,
    options: CompilerOptions,
    user: &UserContext,
) -> LeafResult<CompiledQuery> {
    match resolve(catalog, definition, user).await? {
        Resolution::Resolved {
            query,
            global_filters,
            ..
        } => PanelCompiler::new(dialect_for(dialect), options).compile(&query, &global_filters),
        Resolution::Failed(report) => Err(preflight_error(&report)),
    }
}

async fn to_shrine_json(
    catalog: &Catalog,
    definition: &QueryDefinition,
    user: &UserContext,
    converter: ShrineQueryConverter,
) -> LeafResult<String> {
    let portable = match resolve(catalog, definition, user).await? {
        Resolution::Resolved { query, .. } => federate(&query)?,
        Resolution::Failed(report) => return Err(preflight_error(&report)),
    };
    let shrine = converter.to_shrine_query(&portable, Utc::now())?;
    serde_json::to_string_pretty(&shrine).map_err(LeafError::Serialization)
}

fn preflight_error(report: &leaf_core::PreflightReport) -> LeafError {
    let failures: Vec<String> = report
        .failures()
        .map(|check| check.reference.to_string())
        .collect();
    LeafError::Validation(format!("preflight failed for {}", failures.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
identity:
  name: Leaf CLI
concepts:
  - id: 5c8d5e2e-3f5b-4f55-9f0b-6a8f1d0f4a11
    urn: urn:leaf:concept:visit:ed
    display_name: ED visit
    is_encounter_based: true
    sql_set_from: Encounter
    sql_set_where: "@.Type = 'ED'"
    sql_field_date: "@.AdmitDate"
  - id: 0b7e1c7c-5a40-4bf1-a7f3-2f4b51d3c2a2
    display_name: Local only
    sql_set_from: Person
"#;

    fn query(resource: &str) -> QueryDefinition {
        parse_query(&format!(
            r#"{{ "panels": [{{ "subPanels": [{{ "panelItems": [{{ "resource": "{}" }}] }}] }}] }}"#,
            resource
        ))
        .expect("should parse query")
    }

    fn user() -> UserContext {
        UserContext::builder("cli", "local")
            .identified(true, true)
            .build()
    }

    #[tokio::test]
    async fn test_compile_renders_concept_sql() {
        let catalog = Catalog::from_yaml(CATALOG).expect("should parse catalog");
        let compiled = compile(
            &catalog,
            &query("urn:leaf:concept:visit:ed"),
            SqlDialectKind::PostgreSql,
            CompilerOptions::default(),
            &user(),
        )
        .await
        .expect("should compile");

        let sql = compiled.script();
        assert!(sql.contains("Encounter"));
        assert!(sql.contains("'ED'"));
        assert!(!sql.contains("@."));
    }

    #[tokio::test]
    async fn test_compile_unknown_concept_fails_preflight() {
        let catalog = Catalog::from_yaml(CATALOG).expect("should parse catalog");
        let err = compile(
            &catalog,
            &query("urn:leaf:concept:visit:missing"),
            SqlDialectKind::TSql,
            CompilerOptions::default(),
            &user(),
        )
        .await
        .expect_err("should fail preflight");
        assert!(err.to_string().contains("urn:leaf:concept:visit:missing"));
    }

    #[tokio::test]
    async fn test_shrine_json_uses_urns() {
        let catalog = Catalog::from_yaml(CATALOG).expect("should parse catalog");
        let json = to_shrine_json(
            &catalog,
            &query("urn:leaf:concept:visit:ed"),
            &user(),
            ShrineQueryConverter::new(7, 11),
        )
        .await
        .expect("should convert");

        let value: serde_json::Value = serde_json::from_str(&json).expect("should be JSON");
        assert_eq!(value["nodeOfOriginId"], 7);
        assert_eq!(value["researcherId"], 11);
        assert!(json.contains("urn:leaf:concept:visit:ed"));
    }

    #[tokio::test]
    async fn test_shrine_json_rejects_concept_without_urn() {
        let catalog = Catalog::from_yaml(CATALOG).expect("should parse catalog");
        let err = to_shrine_json(
            &catalog,
            &query("0b7e1c7c-5a40-4bf1-a7f3-2f4b51d3c2a2"),
            &user(),
            ShrineQueryConverter::new(0, 0),
        )
        .await
        .expect_err("should not federate");
        assert!(matches!(err, LeafError::NotFederatable(_)));
    }
}

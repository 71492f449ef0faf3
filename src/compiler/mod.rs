//! Turns a GraphQL document or fragment into an immutable [`Plan`] (spec
//! §4.1). Stateless: the [`crate::planner::Planner`] is what remembers
//! previous results.
pub mod plan;

use std::collections::HashMap;
use std::sync::Arc;

use apollo_compiler::ast;
use apollo_compiler::Node;
use indexmap::IndexMap;
use serde_json_bytes::Value as JsonValue;

use crate::error::{CacheError, Result};
use plan::{ArgTemplate, ConnectionMode, OperationKind, Plan, PlanField};

const TYPENAME: &str = "__typename";

/// Compiles `source` into a [`Plan`]. If the document contains more than
/// one fragment, `fragment_name` selects which one to compile; it is
/// ignored when the document has exactly one operation.
pub fn compile(source: &str, fragment_name: Option<&str>) -> Result<Plan> {
    let document = ast::Document::parse(source, "document.graphql").map_err(|err| {
        tracing::error!(error = %err, "failed to parse document");
        CacheError::MalformedDocument {
            message: format!("{err}"),
        }
    })?;

    let mut fragments: IndexMap<String, Node<ast::FragmentDefinition>> = IndexMap::new();
    let mut operations: Vec<Node<ast::OperationDefinition>> = Vec::new();
    for definition in &document.definitions {
        match definition {
            ast::Definition::FragmentDefinition(fragment) => {
                fragments.insert(fragment.name.to_string(), fragment.clone());
            }
            ast::Definition::OperationDefinition(operation) => {
                operations.push(operation.clone());
            }
            _ => {}
        }
    }

    let root = select_root(fragment_name, &operations, &fragments)?;

    let mut acc = Accumulator::default();
    accumulate(&root.selections, &fragments, &mut acc);
    let (selection_set, selection_map, network_selections) = finalize(acc, &fragments);

    let network_query = build_network_document(&root, network_selections);

    Ok(Plan {
        operation: root.operation,
        root_typename: root.root_typename,
        root: selection_set,
        root_selection_map: selection_map,
        network_query,
    })
}

struct SelectedRoot {
    operation: OperationKind,
    root_typename: String,
    selections: Vec<ast::Selection>,
    name: Option<String>,
    variables: Vec<Node<ast::VariableDefinition>>,
}

fn select_root(
    fragment_name: Option<&str>,
    operations: &[Node<ast::OperationDefinition>],
    fragments: &IndexMap<String, Node<ast::FragmentDefinition>>,
) -> Result<SelectedRoot> {
    if let Some(name) = fragment_name {
        let fragment = fragments
            .get(name)
            .ok_or_else(|| CacheError::UnknownFragmentName {
                name: name.to_string(),
            })?;
        return Ok(SelectedRoot {
            operation: OperationKind::Fragment,
            root_typename: fragment.type_condition.to_string(),
            selections: fragment.selection_set.clone(),
            name: Some(fragment.name.to_string()),
            variables: Vec::new(),
        });
    }

    if operations.len() == 1 {
        let operation = &operations[0];
        let kind = match operation.operation_type {
            ast::OperationType::Query => OperationKind::Query,
            ast::OperationType::Mutation => OperationKind::Mutation,
            ast::OperationType::Subscription => OperationKind::Subscription,
        };
        let root_typename = match operation.operation_type {
            ast::OperationType::Query => "Query",
            ast::OperationType::Mutation => "Mutation",
            ast::OperationType::Subscription => "Subscription",
        };
        return Ok(SelectedRoot {
            operation: kind,
            root_typename: root_typename.to_string(),
            selections: operation.selection_set.clone(),
            name: operation.name.as_ref().map(|n| n.to_string()),
            variables: operation.variables.clone(),
        });
    }

    if operations.is_empty() && fragments.len() == 1 {
        let (_, fragment) = fragments.iter().next().expect("len checked above");
        return Ok(SelectedRoot {
            operation: OperationKind::Fragment,
            root_typename: fragment.type_condition.to_string(),
            selections: fragment.selection_set.clone(),
            name: Some(fragment.name.to_string()),
            variables: Vec::new(),
        });
    }

    Err(CacheError::MalformedDocument {
        message: "expected exactly one operation, or exactly one fragment when fragmentName is omitted".to_string(),
    })
}

/// Accumulates raw (pre-merge) selections for one selection set, keyed by
/// response key. Fragment spreads and inline fragments are flattened into
/// the enclosing set — this crate performs no schema validation, so
/// type-conditional membership isn't checked (documented in DESIGN.md).
#[derive(Default)]
struct Accumulator {
    order: Vec<String>,
    fields: HashMap<String, FieldAccumulator>,
}

struct FieldAccumulator {
    field_name: String,
    response_key: String,
    arguments: Vec<Node<ast::Argument>>,
    directives: ast::DirectiveList,
    sub_selections: Vec<ast::Selection>,
}

fn accumulate(
    selections: &[ast::Selection],
    fragments: &IndexMap<String, Node<ast::FragmentDefinition>>,
    acc: &mut Accumulator,
) {
    for selection in selections {
        match selection {
            ast::Selection::Field(field) => {
                let response_key = field
                    .alias
                    .as_ref()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| field.name.to_string());
                let entry = acc.fields.entry(response_key.clone()).or_insert_with(|| {
                    acc.order.push(response_key.clone());
                    FieldAccumulator {
                        field_name: field.name.to_string(),
                        response_key: response_key.clone(),
                        arguments: field.arguments.clone(),
                        directives: field.directives.clone(),
                        sub_selections: Vec::new(),
                    }
                });
                entry.sub_selections.extend(field.selection_set.clone());
            }
            ast::Selection::FragmentSpread(spread) => {
                if let Some(fragment) = fragments.get(spread.fragment_name.as_str()) {
                    accumulate(&fragment.selection_set, fragments, acc);
                }
                // Unknown fragment spreads are silently dropped: the core
                // performs no schema validation (spec Non-goals), and the
                // strict UnknownFragmentName error only applies to the
                // top-level `fragmentName` compile argument.
            }
            ast::Selection::InlineFragment(inline) => {
                accumulate(&inline.selection_set, fragments, acc);
            }
        }
    }
}

/// Converts an [`Accumulator`] into the immutable plan tree, injecting
/// `__typename` into this selection set (spec §4.1) and producing the
/// parallel, directive-stripped network selection list.
fn finalize(
    acc: Accumulator,
    fragments: &IndexMap<String, Node<ast::FragmentDefinition>>,
) -> (Vec<Arc<PlanField>>, IndexMap<String, Arc<PlanField>>, Vec<ast::Selection>) {
    let mut root = Vec::new();
    let mut map = IndexMap::new();
    let mut network = Vec::new();

    if !acc.order.is_empty() && !acc.fields.contains_key(TYPENAME) {
        let typename_field = Arc::new(PlanField {
            field_name: TYPENAME.to_string(),
            response_key: TYPENAME.to_string(),
            args: Vec::new(),
            selection_set: Vec::new(),
            selection_map: IndexMap::new(),
            is_connection: false,
            connection_key: None,
            connection_filters: Vec::new(),
            connection_mode: ConnectionMode::Infinite,
        });
        root.push(typename_field.clone());
        map.insert(TYPENAME.to_string(), typename_field);
        network.push(ast::Selection::Field(Node::new(ast::Field {
            alias: None,
            name: ast::Name::new_unchecked(TYPENAME.into()),
            arguments: Vec::new(),
            directives: Default::default(),
            selection_set: Vec::new(),
        })));
    }

    for response_key in acc.order {
        let field = acc.fields.get(&response_key).expect("accumulated key");
        let has_children = !field.sub_selections.is_empty();

        let mut child_acc = Accumulator::default();
        accumulate(&field.sub_selections, fragments, &mut child_acc);
        let (child_root, child_map, child_network) = if has_children {
            finalize(child_acc, fragments)
        } else {
            (Vec::new(), IndexMap::new(), Vec::new())
        };

        let (is_connection, connection_key, connection_filters, connection_mode) =
            connection_metadata(&field.directives, &field.field_name);
        let args = field
            .arguments
            .iter()
            .map(|arg| (arg.name.to_string(), value_to_arg_template(&arg.value)))
            .collect();

        let plan_field = Arc::new(PlanField {
            field_name: field.field_name.clone(),
            response_key: response_key.clone(),
            args,
            selection_set: child_root,
            selection_map: child_map,
            is_connection,
            connection_key,
            connection_filters,
            connection_mode,
        });

        root.push(plan_field.clone());
        map.insert(response_key.clone(), plan_field);

        network.push(ast::Selection::Field(Node::new(ast::Field {
            alias: if field.response_key != field.field_name {
                Some(ast::Name::new_unchecked(field.response_key.clone().into()))
            } else {
                None
            },
            name: ast::Name::new_unchecked(field.field_name.clone().into()),
            arguments: field.arguments.clone(),
            directives: strip_connection_directive(&field.directives),
            selection_set: child_network,
        })));
    }

    (root, map, network)
}

/// Extracts `@connection(key, filters, mode)` metadata and reports whether
/// the directive was present at all.
fn connection_metadata(
    directives: &ast::DirectiveList,
    field_name: &str,
) -> (bool, Option<String>, Vec<String>, ConnectionMode) {
    let Some(directive) = directives.get("connection") else {
        return (false, None, Vec::new(), ConnectionMode::Infinite);
    };

    let key = directive
        .specified_argument_by_name("key")
        .and_then(value_as_string)
        .unwrap_or_else(|| field_name.to_string());

    let filters = directive
        .specified_argument_by_name("filters")
        .map(|value| match value.as_ref() {
            ast::Value::List(items) => items.iter().filter_map(|v| value_as_string(v)).collect(),
            _ => Vec::new(),
        })
        .unwrap_or_default();

    let mode = directive
        .specified_argument_by_name("mode")
        .and_then(value_as_string)
        .map(|m| if m == "page" { ConnectionMode::Page } else { ConnectionMode::Infinite })
        .unwrap_or(ConnectionMode::Infinite);

    (true, Some(key), filters, mode)
}

fn strip_connection_directive(directives: &ast::DirectiveList) -> ast::DirectiveList {
    directives
        .iter()
        .filter(|d| d.name.as_str() != "connection")
        .cloned()
        .collect()
}

fn value_as_string(value: &Node<ast::Value>) -> Option<String> {
    match value.as_ref() {
        ast::Value::String(s) => Some(s.to_string()),
        ast::Value::Enum(name) => Some(name.to_string()),
        _ => None,
    }
}

fn value_to_arg_template(value: &Node<ast::Value>) -> ArgTemplate {
    match value.as_ref() {
        ast::Value::Variable(name) => ArgTemplate::Variable(name.to_string()),
        ast::Value::Null => ArgTemplate::Literal(JsonValue::Null),
        ast::Value::Boolean(b) => ArgTemplate::Literal(JsonValue::Bool(*b)),
        ast::Value::Int(i) => ArgTemplate::Literal(
            i.to_string()
                .parse::<i64>()
                .map(JsonValue::from)
                .unwrap_or(JsonValue::Null),
        ),
        ast::Value::Float(f) => ArgTemplate::Literal(
            f.to_string()
                .parse::<f64>()
                .map(JsonValue::from)
                .unwrap_or(JsonValue::Null),
        ),
        ast::Value::String(s) => ArgTemplate::Literal(JsonValue::String(s.to_string().into())),
        ast::Value::Enum(name) => ArgTemplate::Literal(JsonValue::String(name.to_string().into())),
        ast::Value::List(items) => ArgTemplate::List(items.iter().map(value_to_arg_template).collect()),
        ast::Value::Object(fields) => ArgTemplate::Object(
            fields
                .iter()
                .map(|(name, value)| (name.to_string(), value_to_arg_template(value)))
                .collect(),
        ),
    }
}

fn build_network_document(root: &SelectedRoot, selections: Vec<ast::Selection>) -> ast::Document {
    let definition = match root.operation {
        OperationKind::Fragment => ast::Definition::FragmentDefinition(Node::new(ast::FragmentDefinition {
            name: ast::Name::new_unchecked(root.name.clone().unwrap_or_default().into()),
            type_condition: ast::Name::new_unchecked(root.root_typename.clone().into()),
            directives: Default::default(),
            selection_set: selections,
        })),
        OperationKind::Query | OperationKind::Mutation | OperationKind::Subscription => {
            let operation_type = match root.operation {
                OperationKind::Query => ast::OperationType::Query,
                OperationKind::Mutation => ast::OperationType::Mutation,
                OperationKind::Subscription => ast::OperationType::Subscription,
                OperationKind::Fragment => unreachable!(),
            };
            ast::Definition::OperationDefinition(Node::new(ast::OperationDefinition {
                operation_type,
                name: root.name.as_ref().map(|n| ast::Name::new_unchecked(n.clone().into())),
                variables: root.variables.clone(),
                directives: Default::default(),
                selection_set: selections,
            }))
        }
    };

    ast::Document {
        definitions: vec![definition],
        ..Default::default()
    }
}

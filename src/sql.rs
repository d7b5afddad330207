use std::collections::HashMap;

use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, TableWithJoins, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyChannel;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SetActor {
        actor: Ulid,
    },
    ResetActor,
    Listen {
        channel: NotifyChannel,
    },
    /// `None` is `UNLISTEN *`.
    Unlisten {
        channel: Option<NotifyChannel>,
    },
    InsertUser {
        id: Ulid,
        name: String,
        email: String,
        role: Role,
    },
    InsertSpecialization {
        id: Ulid,
        name: String,
        description: Option<String>,
    },
    InsertVeterinarian {
        id: Ulid,
        user_id: Ulid,
        license_number: String,
        experience_years: u32,
        consultation_fee: Cents,
        bio: Option<String>,
    },
    AssignSpecialization {
        veterinarian_id: Ulid,
        specialization_id: Ulid,
    },
    InsertPet {
        id: Ulid,
        profile: PetProfile,
    },
    UpdatePet {
        id: Ulid,
        profile: PetProfile,
    },
    DeletePet {
        id: Ulid,
    },
    InsertTimeSlot {
        id: Ulid,
        veterinarian_id: Ulid,
        start: Ms,
        end: Ms,
        blocked: bool,
    },
    DeleteTimeSlot {
        id: Ulid,
    },
    BlockSlot {
        time_slot_id: Ulid,
    },
    UnblockSlot {
        time_slot_id: Ulid,
    },
    InsertAppointment {
        id: Ulid,
        veterinarian_id: Ulid,
        pet_id: Ulid,
        time_slot_id: Ulid,
    },
    CancelAppointment {
        id: Ulid,
    },
    AdvanceAppointment {
        appointment_id: Ulid,
        status: AppointmentStatus,
    },
    InsertPayment {
        id: Ulid,
        appointment_id: Ulid,
        gateway: PaymentGateway,
        transaction_id: String,
    },
    SettlePayment {
        payment_id: Ulid,
        status: PaymentStatus,
        reference: Option<String>,
    },
    InsertHomepageContent {
        id: Ulid,
        title: String,
        description: Option<String>,
        image_path: Option<String>,
        order: i32,
        published: bool,
    },
    DeleteHomepageContent {
        id: Ulid,
    },
    SetHomepagePublished {
        id: Ulid,
        published: bool,
    },
    SelectAvailability {
        veterinarian_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectOpenWindows {
        veterinarian_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectTimeSlots {
        veterinarian_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectVeterinarians {
        query: Option<String>,
        specialization_id: Option<Ulid>,
        page: usize,
    },
    SelectVeterinarian {
        id: Ulid,
    },
    SelectSpecializations,
    SelectPets,
    SelectAppointments {
        page: usize,
    },
    SelectAppointment {
        id: Ulid,
    },
    SelectPayments,
    SelectNotifications,
    SelectHomepageContents,
}

/// Column order used when an INSERT has no column list.
pub fn insert_columns(table: &str) -> Option<&'static [&'static str]> {
    let columns: &'static [&'static str] = match table {
        "users" => &["id", "name", "email", "role"],
        "specializations" => &["id", "name", "description"],
        "veterinarians" => &[
            "id",
            "user_id",
            "license_number",
            "experience_years",
            "consultation_fee",
            "bio",
        ],
        "veterinarian_specializations" => &["veterinarian_id", "specialization_id"],
        "pets" => &[
            "id",
            "name",
            "species",
            "breed",
            "age",
            "weight",
            "gender",
            "medical_notes",
        ],
        "time_slots" => &["id", "veterinarian_id", "start", "end", "blocked"],
        "slot_blocks" => &["time_slot_id"],
        "appointments" => &["id", "veterinarian_id", "pet_id", "time_slot_id"],
        "appointment_transitions" => &["appointment_id", "status"],
        "payments" => &["id", "appointment_id", "gateway", "transaction_id"],
        "payment_outcomes" => &["payment_id", "status", "reference"],
        "homepage_contents" => &["id", "title", "description", "image_path", "order", "published"],
        "homepage_publications" => &["content_id"],
        _ => return None,
    };
    Some(columns)
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(cmd) = parse_actor_statement(trimmed)? {
        return Ok(cmd);
    }
    if let Some(cmd) = parse_listen_statement(trimmed)? {
        return Ok(cmd);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            from: None,
            selection,
            returning: None,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// The FROM table of a SELECT, placeholders allowed. Used to describe
/// result rows before parameters are bound.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

/// `SET actor = '<ulid>'`, `SET actor TO '<ulid>'` and `RESET actor`.
fn parse_actor_statement(trimmed: &str) -> Result<Option<Command>, SqlError> {
    let upper = trimmed.to_uppercase();
    if upper == "RESET ACTOR" {
        return Ok(Some(Command::ResetActor));
    }
    if !upper.starts_with("SET ACTOR") {
        return Ok(None);
    }
    let Some(rest) = trimmed.get("SET ACTOR".len()..).map(str::trim_start) else {
        return Ok(None);
    };
    let value = if let Some(v) = rest.strip_prefix('=') {
        v
    } else if rest.get(..3).is_some_and(|kw| kw.eq_ignore_ascii_case("TO ")) {
        &rest[3..]
    } else {
        return Ok(None);
    };
    let value = value.trim().trim_matches('\'');
    let actor = Ulid::from_string(value).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))?;
    Ok(Some(Command::SetActor { actor }))
}

/// `LISTEN <channel>`, `UNLISTEN <channel>` and `UNLISTEN *`.
fn parse_listen_statement(trimmed: &str) -> Result<Option<Command>, SqlError> {
    let Some((keyword, rest)) = trimmed.split_once(char::is_whitespace) else {
        return Ok(None);
    };
    let rest = rest.trim();
    let channel = || rest.parse::<NotifyChannel>().map_err(SqlError::Parse);
    if keyword.eq_ignore_ascii_case("LISTEN") {
        Ok(Some(Command::Listen { channel: channel()? }))
    } else if keyword.eq_ignore_ascii_case("UNLISTEN") {
        let channel = if rest == "*" { None } else { Some(channel()?) };
        Ok(Some(Command::Unlisten { channel }))
    } else {
        Ok(None)
    }
}

/// One VALUES row keyed by column name.
struct Row<'a> {
    table: &'static str,
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.values
            .get(column)
            .copied()
            .ok_or(SqlError::MissingColumn(self.table, column))
    }

    /// Absent and NULL both read as `None`.
    fn optional(&self, column: &str) -> Option<&'a Expr> {
        self.values
            .get(column)
            .copied()
            .filter(|e| !matches!(extract_value(e), Some(Value::Null)))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let row = bind_row(&table, &insert.columns, &rows[0])?;

    match row.table {
        "users" => {
            let role_text = parse_string(row.required("role")?)?;
            Ok(Command::InsertUser {
                id: parse_ulid(row.required("id")?)?,
                name: parse_string(row.required("name")?)?,
                email: parse_string(row.required("email")?)?,
                role: Role::parse(&role_text)
                    .ok_or_else(|| SqlError::Parse(format!("unknown role: {role_text}")))?,
            })
        }
        "specializations" => Ok(Command::InsertSpecialization {
            id: parse_ulid(row.required("id")?)?,
            name: parse_string(row.required("name")?)?,
            description: row.optional("description").map(parse_string).transpose()?,
        }),
        "veterinarians" => Ok(Command::InsertVeterinarian {
            id: parse_ulid(row.required("id")?)?,
            user_id: parse_ulid(row.required("user_id")?)?,
            license_number: parse_string(row.required("license_number")?)?,
            experience_years: row.optional("experience_years").map(parse_u32).transpose()?.unwrap_or(0),
            consultation_fee: parse_decimal(row.required("consultation_fee")?, 2)?,
            bio: row.optional("bio").map(parse_string).transpose()?,
        }),
        "veterinarian_specializations" => Ok(Command::AssignSpecialization {
            veterinarian_id: parse_ulid(row.required("veterinarian_id")?)?,
            specialization_id: parse_ulid(row.required("specialization_id")?)?,
        }),
        "pets" => Ok(Command::InsertPet {
            id: parse_ulid(row.required("id")?)?,
            profile: pet_profile(&row)?,
        }),
        "time_slots" => Ok(Command::InsertTimeSlot {
            id: parse_ulid(row.required("id")?)?,
            veterinarian_id: parse_ulid(row.required("veterinarian_id")?)?,
            start: parse_i64(row.required("start")?)?,
            end: parse_i64(row.required("end")?)?,
            blocked: row.optional("blocked").map(parse_bool).transpose()?.unwrap_or(false),
        }),
        "slot_blocks" => Ok(Command::BlockSlot {
            time_slot_id: parse_ulid(row.required("time_slot_id")?)?,
        }),
        "appointments" => Ok(Command::InsertAppointment {
            id: parse_ulid(row.required("id")?)?,
            veterinarian_id: parse_ulid(row.required("veterinarian_id")?)?,
            pet_id: parse_ulid(row.required("pet_id")?)?,
            time_slot_id: parse_ulid(row.required("time_slot_id")?)?,
        }),
        "appointment_transitions" => {
            let status_text = parse_string(row.required("status")?)?;
            Ok(Command::AdvanceAppointment {
                appointment_id: parse_ulid(row.required("appointment_id")?)?,
                status: AppointmentStatus::parse(&status_text)
                    .ok_or_else(|| SqlError::Parse(format!("unknown status: {status_text}")))?,
            })
        }
        "payments" => {
            let gateway_text = parse_string(row.required("gateway")?)?;
            Ok(Command::InsertPayment {
                id: parse_ulid(row.required("id")?)?,
                appointment_id: parse_ulid(row.required("appointment_id")?)?,
                gateway: PaymentGateway::parse(&gateway_text)
                    .ok_or_else(|| SqlError::Parse(format!("unknown gateway: {gateway_text}")))?,
                transaction_id: parse_string(row.required("transaction_id")?)?,
            })
        }
        "payment_outcomes" => {
            let status_text = parse_string(row.required("status")?)?;
            Ok(Command::SettlePayment {
                payment_id: parse_ulid(row.required("payment_id")?)?,
                status: PaymentStatus::parse(&status_text)
                    .ok_or_else(|| SqlError::Parse(format!("unknown payment status: {status_text}")))?,
                reference: row.optional("reference").map(parse_string).transpose()?,
            })
        }
        "homepage_contents" => Ok(Command::InsertHomepageContent {
            id: parse_ulid(row.required("id")?)?,
            title: parse_string(row.required("title")?)?,
            description: row.optional("description").map(parse_string).transpose()?,
            image_path: row.optional("image_path").map(parse_string).transpose()?,
            order: row.optional("order").map(parse_i32).transpose()?.unwrap_or(0),
            published: row.optional("published").map(parse_bool).transpose()?.unwrap_or(false),
        }),
        "homepage_publications" => Ok(Command::SetHomepagePublished {
            id: parse_ulid(row.required("content_id")?)?,
            published: true,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Pair values with column names: the explicit column list if present,
/// otherwise the table's declared order.
fn bind_row<'a>(table: &str, columns: &[ast::Ident], values: &'a [Expr]) -> Result<Row<'a>, SqlError> {
    let declared = insert_columns(table).ok_or_else(|| SqlError::UnknownTable(table.to_string()))?;
    let table: &'static str = declared_table_name(table)?;
    let names: Vec<String> = if columns.is_empty() {
        if values.len() > declared.len() {
            return Err(SqlError::WrongArity(table, declared.len(), values.len()));
        }
        declared.iter().map(|c| c.to_string()).collect()
    } else {
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        let names: Vec<String> = columns.iter().map(|c| c.value.to_lowercase()).collect();
        if let Some(unknown) = names.iter().find(|n| !declared.contains(&n.as_str())) {
            return Err(SqlError::UnknownColumn(table, unknown.clone()));
        }
        names
    };
    Ok(Row {
        table,
        values: names.into_iter().zip(values.iter()).collect(),
    })
}

fn pet_profile(row: &Row<'_>) -> Result<PetProfile, SqlError> {
    let species_text = parse_string(row.required("species")?)?;
    let gender_text = parse_string(row.required("gender")?)?;
    let weight_grams = parse_decimal(row.required("weight")?, 3)?;
    Ok(PetProfile {
        name: parse_string(row.required("name")?)?,
        species: Species::parse(&species_text)
            .ok_or_else(|| SqlError::Parse(format!("unknown species: {species_text}")))?,
        breed: parse_string(row.required("breed")?)?,
        age: parse_u32(row.required("age")?)?,
        weight_grams: u32::try_from(weight_grams)
            .map_err(|_| SqlError::Parse(format!("weight out of range: {weight_grams}")))?,
        gender: Gender::parse(&gender_text)
            .ok_or_else(|| SqlError::Parse(format!("unknown gender: {gender_text}")))?,
        medical_notes: row.optional("medical_notes").map(parse_string).transpose()?,
    })
}

/// `UPDATE pets SET name = …, species = …, … WHERE id = …`. Every profile
/// column is required; an omitted `medical_notes` clears the notes.
fn parse_update(
    table: &TableWithJoins,
    assignments: &[Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != "pets" {
        return Err(SqlError::Unsupported(format!("UPDATE {name}")));
    }
    let declared = insert_columns("pets").unwrap_or(&[]);
    let mut values = HashMap::new();
    for assignment in assignments {
        let AssignmentTarget::ColumnName(column) = &assignment.target else {
            return Err(SqlError::Unsupported("tuple assignment".into()));
        };
        let column = object_name_last(column)
            .ok_or_else(|| SqlError::Parse("empty column name".into()))?;
        if column == "id" || !declared.contains(&column.as_str()) {
            return Err(SqlError::UnknownColumn("pets", column));
        }
        values.insert(column, &assignment.value);
    }
    let row = Row {
        table: "pets",
        values,
    };
    Ok(Command::UpdatePet {
        id: extract_where_id(selection, &["id"])?,
        profile: pet_profile(&row)?,
    })
}

fn declared_table_name(table: &str) -> Result<&'static str, SqlError> {
    const TABLES: &[&str] = &[
        "users",
        "specializations",
        "veterinarians",
        "veterinarian_specializations",
        "pets",
        "time_slots",
        "slot_blocks",
        "appointments",
        "appointment_transitions",
        "payments",
        "payment_outcomes",
        "homepage_contents",
        "homepage_publications",
    ];
    TABLES
        .iter()
        .find(|t| **t == table)
        .copied()
        .ok_or_else(|| SqlError::UnknownTable(table.to_string()))
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "pets" => Ok(Command::DeletePet {
            id: extract_where_id(&delete.selection, &["id"])?,
        }),
        "time_slots" => Ok(Command::DeleteTimeSlot {
            id: extract_where_id(&delete.selection, &["id"])?,
        }),
        "slot_blocks" => Ok(Command::UnblockSlot {
            time_slot_id: extract_where_id(&delete.selection, &["id", "time_slot_id"])?,
        }),
        "appointments" => Ok(Command::CancelAppointment {
            id: extract_where_id(&delete.selection, &["id"])?,
        }),
        "homepage_contents" => Ok(Command::DeleteHomepageContent {
            id: extract_where_id(&delete.selection, &["id"])?,
        }),
        "homepage_publications" => Ok(Command::SetHomepagePublished {
            id: extract_where_id(&delete.selection, &["id", "content_id"])?,
            published: false,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters);
    }

    match table.as_str() {
        "availability" | "open_windows" | "time_slots" => {
            let veterinarian_id = parse_ulid(filters.eq("veterinarian_id")?)?;
            let start = parse_i64(filters.ge("start")?)?;
            let end = parse_i64(filters.le("start")?)?;
            Ok(match table.as_str() {
                "availability" => Command::SelectAvailability {
                    veterinarian_id,
                    start,
                    end,
                },
                "open_windows" => Command::SelectOpenWindows {
                    veterinarian_id,
                    start,
                    end,
                },
                _ => Command::SelectTimeSlots {
                    veterinarian_id,
                    start,
                    end,
                },
            })
        }
        "veterinarians" => {
            if let Some(id) = filters.eq_opt("id") {
                return Ok(Command::SelectVeterinarian { id: parse_ulid(id)? });
            }
            Ok(Command::SelectVeterinarians {
                query: filters.eq_opt("query").map(parse_string).transpose()?,
                specialization_id: filters.eq_opt("specialization_id").map(parse_ulid).transpose()?,
                page: filters.eq_opt("page").map(parse_page).transpose()?.unwrap_or(0),
            })
        }
        "appointments" => {
            if let Some(id) = filters.eq_opt("id") {
                return Ok(Command::SelectAppointment { id: parse_ulid(id)? });
            }
            Ok(Command::SelectAppointments {
                page: filters.eq_opt("page").map(parse_page).transpose()?.unwrap_or(0),
            })
        }
        "specializations" => Ok(Command::SelectSpecializations),
        "pets" => Ok(Command::SelectPets),
        "payments" => Ok(Command::SelectPayments),
        "notifications" => Ok(Command::SelectNotifications),
        "homepage_contents" => Ok(Command::SelectHomepageContents),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column op value` conjuncts from a WHERE clause.
#[derive(Default)]
struct Filters {
    eq: HashMap<String, Expr>,
    ge: HashMap<String, Expr>,
    le: HashMap<String, Expr>,
}

impl Filters {
    fn eq_opt(&self, column: &str) -> Option<&Expr> {
        self.eq.get(column)
    }

    fn eq(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.eq.get(column).ok_or(SqlError::MissingFilter(column))
    }

    fn ge(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.ge.get(column).ok_or(SqlError::MissingFilter(column))
    }

    fn le(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.le.get(column).ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_filters(expr: &Expr, filters: &mut Filters) {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, filters);
                collect_filters(right, filters);
            }
            ast::BinaryOperator::Eq | ast::BinaryOperator::GtEq | ast::BinaryOperator::LtEq => {
                let Some(col) = expr_column_name(left) else { return };
                let target = match op {
                    ast::BinaryOperator::Eq => &mut filters.eq,
                    ast::BinaryOperator::GtEq => &mut filters.ge,
                    _ => &mut filters.le,
                };
                target.insert(col, (**right).clone());
            }
            _ => {}
        },
        Expr::Nested(inner) => collect_filters(inner, filters),
        _ => {}
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// `WHERE <key> = '<ulid>'` for any of the accepted key columns.
fn extract_where_id(selection: &Option<Expr>, keys: &[&'static str]) -> Result<Ulid, SqlError> {
    let missing = SqlError::MissingFilter(keys[0]);
    let sel = selection.as_ref().ok_or(missing)?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => match expr_column_name(left) {
            Some(col) if keys.contains(&col.as_str()) => parse_ulid(right),
            _ => Err(SqlError::MissingFilter(keys[0])),
        },
        _ => Err(SqlError::MissingFilter(keys[0])),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
}

fn parse_page(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("bad page: {v}")))
}

/// Exact decimal to integer minor units: `parse_decimal("12.5", 2)` is 1250.
fn parse_decimal(expr: &Expr, scale: u32) -> Result<i64, SqlError> {
    let text = match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s.clone(),
        _ => {
            if let Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr,
            } = expr
            {
                return Ok(-parse_decimal(expr, scale)?);
            }
            return Err(SqlError::Parse(format!("expected number, got {expr:?}")));
        }
    };
    decimal_to_minor(&text, scale)
}

fn decimal_to_minor(text: &str, scale: u32) -> Result<i64, SqlError> {
    let bad = || SqlError::Parse(format!("bad decimal: {text}"));
    let (negative, digits) = match text.trim().strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.trim()),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if (whole.is_empty() && frac.is_empty()) || frac.len() > scale as usize {
        return Err(bad());
    }
    if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return Err(bad());
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| bad())? };
    let frac_padded = format!("{frac:0<width$}", width = scale as usize);
    let frac: i64 = if frac_padded.is_empty() { 0 } else { frac_padded.parse().map_err(|_| bad())? };
    let value = whole
        .checked_mul(10_i64.pow(scale))
        .and_then(|w| w.checked_add(frac))
        .ok_or_else(bad)?;
    Ok(if negative { -value } else { value })
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    #[test]
    fn parse_set_and_reset_actor() {
        assert_eq!(
            parse_sql(&format!("SET actor = '{ID}'")).unwrap(),
            Command::SetActor { actor: id() }
        );
        assert_eq!(
            parse_sql(&format!("set actor to '{ID}';")).unwrap(),
            Command::SetActor { actor: id() }
        );
        assert_eq!(parse_sql("RESET actor").unwrap(), Command::ResetActor);
        assert!(parse_sql("SET actor = 'nope'").is_err());
    }

    #[test]
    fn parse_listen_and_unlisten() {
        assert_eq!(
            parse_sql(&format!("LISTEN vet_{ID};")).unwrap(),
            Command::Listen {
                channel: NotifyChannel::Veterinarian(id())
            }
        );
        assert_eq!(
            parse_sql(&format!("unlisten \"user_{ID}\"")).unwrap(),
            Command::Unlisten {
                channel: Some(NotifyChannel::User(id()))
            }
        );
        assert_eq!(parse_sql("UNLISTEN *").unwrap(), Command::Unlisten { channel: None });
        assert!(matches!(parse_sql("LISTEN resource_1"), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_insert_user_named_columns() {
        let sql = format!(
            "INSERT INTO users (role, email, name, id) VALUES ('pet_owner', 'rahim@clinic.test', 'Rahim', '{ID}')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertUser {
                id: id(),
                name: "Rahim".into(),
                email: "rahim@clinic.test".into(),
                role: Role::PetOwner,
            }
        );
    }

    #[test]
    fn parse_insert_user_positional() {
        let sql = format!("INSERT INTO users VALUES ('{ID}', 'Dr. Karim', 'karim@clinic.test', 'veterinarian')");
        match parse_sql(&sql).unwrap() {
            Command::InsertUser { role, .. } => assert_eq!(role, Role::Veterinarian),
            other => panic!("expected InsertUser, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_veterinarian_fee_in_decimal() {
        let sql = format!(
            "INSERT INTO veterinarians (id, user_id, license_number, experience_years, consultation_fee) \
             VALUES ('{ID}', '{ID}', 'BVC-1021', 7, 500.50)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertVeterinarian {
                experience_years,
                consultation_fee,
                bio,
                ..
            } => {
                assert_eq!(experience_years, 7);
                assert_eq!(consultation_fee, 50_050);
                assert_eq!(bio, None);
            }
            other => panic!("expected InsertVeterinarian, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_pet() {
        let sql = format!(
            "INSERT INTO pets (id, name, species, breed, age, weight, gender, medical_notes) \
             VALUES ('{ID}', 'Bella', 'dog', 'Labrador', 4, 28.5, 'female', NULL)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertPet { profile, .. } => {
                assert_eq!(profile.species, Species::Dog);
                assert_eq!(profile.weight_grams, 28_500);
                assert_eq!(profile.gender, Gender::Female);
                assert_eq!(profile.medical_notes, None);
            }
            other => panic!("expected InsertPet, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_pet_rejects_unknown_species() {
        let sql = format!(
            "INSERT INTO pets VALUES ('{ID}', 'Rex', 'dragon', 'Welsh', 900, 1000, 'male', NULL)"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_update_pet() {
        let sql = format!(
            "UPDATE pets SET name = 'Bella', species = 'cat', breed = 'Siamese', age = 5, \
             weight = 4.25, gender = 'female', medical_notes = 'allergic to penicillin' \
             WHERE id = '{ID}'"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpdatePet { id: pet, profile } => {
                assert_eq!(pet, id());
                assert_eq!(profile.species, Species::Cat);
                assert_eq!(profile.weight_grams, 4_250);
                assert_eq!(profile.medical_notes.as_deref(), Some("allergic to penicillin"));
            }
            other => panic!("expected UpdatePet, got {other:?}"),
        }
    }

    #[test]
    fn parse_update_pet_needs_full_profile_and_id() {
        let partial = format!("UPDATE pets SET name = 'Bella' WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&partial),
            Err(SqlError::MissingColumn("pets", "species"))
        ));

        let no_filter = "UPDATE pets SET name = 'Bella', species = 'dog', breed = 'Lab', \
                         age = 4, weight = 28.5, gender = 'female'";
        assert!(matches!(parse_sql(no_filter), Err(SqlError::MissingFilter("id"))));

        let owner = format!("UPDATE pets SET owner_id = '{ID}' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&owner), Err(SqlError::UnknownColumn("pets", _))));

        let slots = format!("UPDATE time_slots SET start = 0 WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&slots), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_insert_time_slot() {
        let sql = format!(
            r#"INSERT INTO time_slots (id, veterinarian_id, start, "end") VALUES ('{ID}', '{ID}', 1000, 2000)"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertTimeSlot {
                id: id(),
                veterinarian_id: id(),
                start: 1000,
                end: 2000,
                blocked: false,
            }
        );
    }

    #[test]
    fn parse_insert_appointment() {
        let sql = format!(
            "INSERT INTO appointments (id, veterinarian_id, pet_id, time_slot_id) VALUES ('{ID}', '{ID}', '{ID}', '{ID}')"
        );
        assert!(matches!(parse_sql(&sql).unwrap(), Command::InsertAppointment { .. }));
    }

    #[test]
    fn parse_delete_appointment_is_cancel() {
        let sql = format!("DELETE FROM appointments WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::CancelAppointment { id: id() });
    }

    #[test]
    fn parse_block_and_unblock() {
        let block = format!("INSERT INTO slot_blocks (time_slot_id) VALUES ('{ID}')");
        assert_eq!(parse_sql(&block).unwrap(), Command::BlockSlot { time_slot_id: id() });
        let unblock = format!("DELETE FROM slot_blocks WHERE time_slot_id = '{ID}'");
        assert_eq!(parse_sql(&unblock).unwrap(), Command::UnblockSlot { time_slot_id: id() });
    }

    #[test]
    fn parse_transition_and_settlement() {
        let advance = format!("INSERT INTO appointment_transitions VALUES ('{ID}', 'confirmed')");
        assert_eq!(
            parse_sql(&advance).unwrap(),
            Command::AdvanceAppointment {
                appointment_id: id(),
                status: AppointmentStatus::Confirmed,
            }
        );
        let settle = format!("INSERT INTO payment_outcomes (payment_id, status) VALUES ('{ID}', 'completed')");
        assert_eq!(
            parse_sql(&settle).unwrap(),
            Command::SettlePayment {
                payment_id: id(),
                status: PaymentStatus::Completed,
                reference: None,
            }
        );
    }

    #[test]
    fn parse_homepage_publication() {
        let publish = format!("INSERT INTO homepage_publications (content_id) VALUES ('{ID}')");
        assert_eq!(
            parse_sql(&publish).unwrap(),
            Command::SetHomepagePublished { id: id(), published: true }
        );
        let unpublish = format!("DELETE FROM homepage_publications WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&unpublish).unwrap(),
            Command::SetHomepagePublished { id: id(), published: false }
        );
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!(
            "SELECT * FROM availability WHERE veterinarian_id = '{ID}' AND start >= 1000 AND start <= 2000"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                veterinarian_id: id(),
                start: 1000,
                end: 2000,
            }
        );
    }

    #[test]
    fn parse_select_availability_requires_window() {
        let sql = format!("SELECT * FROM availability WHERE veterinarian_id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("start"))));
    }

    #[test]
    fn parse_select_veterinarians_with_filters() {
        let sql = format!(
            "SELECT * FROM veterinarians WHERE query = 'surgery' AND specialization_id = '{ID}' AND page = 2"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectVeterinarians {
                query: Some("surgery".into()),
                specialization_id: Some(id()),
                page: 2,
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM veterinarians").unwrap(),
            Command::SelectVeterinarians {
                query: None,
                specialization_id: None,
                page: 0,
            }
        );
    }

    #[test]
    fn parse_select_appointment_by_id() {
        let sql = format!("SELECT * FROM appointments WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::SelectAppointment { id: id() });
        assert_eq!(
            parse_sql("SELECT * FROM appointments").unwrap(),
            Command::SelectAppointments { page: 0 }
        );
    }

    #[test]
    fn named_columns_must_match_values() {
        let sql = format!("INSERT INTO users (id, name) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("users", 2, 1))));
        let sql = format!("INSERT INTO users (id, nickname) VALUES ('{ID}', 'x')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("users", _))));
        let sql = format!("INSERT INTO users (id, name) VALUES ('{ID}', 'x')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("users", "email"))));
    }

    #[test]
    fn decimals_convert_exactly() {
        assert_eq!(decimal_to_minor("500", 2).unwrap(), 50_000);
        assert_eq!(decimal_to_minor("0.05", 2).unwrap(), 5);
        assert_eq!(decimal_to_minor(".5", 3).unwrap(), 500);
        assert_eq!(decimal_to_minor("-1.25", 2).unwrap(), -125);
        assert!(decimal_to_minor("1.005", 2).is_err());
        assert!(decimal_to_minor("1e3", 2).is_err());
    }

    #[test]
    fn select_table_accepts_placeholders() {
        assert_eq!(
            select_table("SELECT * FROM availability WHERE veterinarian_id = $1 AND start >= $2").as_deref(),
            Some("availability")
        );
        assert_eq!(select_table("DELETE FROM pets WHERE id = $1"), None);
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}

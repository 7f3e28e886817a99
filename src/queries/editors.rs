use sea_query::{Expr, Query, SqliteQueryBuilder};

use crate::schema::Editors;

/// INSERT INTO editors (login, pass_hash) VALUES (?, ?)
pub fn insert(login: &str, pass_hash: &str) -> String {
    Query::insert()
        .into_table(Editors::Table)
        .columns([Editors::Login, Editors::PassHash])
        .values_panic([login.into(), pass_hash.into()])
        .to_string(SqliteQueryBuilder)
}

/// SELECT id, login, pass_hash FROM editors WHERE login = ?
pub fn select_by_login(login: &str) -> String {
    Query::select()
        .columns([Editors::Id, Editors::Login, Editors::PassHash])
        .from(Editors::Table)
        .and_where(Expr::col(Editors::Login).eq(login))
        .to_string(SqliteQueryBuilder)
}

/// DELETE FROM editors WHERE login = ?
pub fn delete_by_login(login: &str) -> String {
    Query::delete()
        .from_table(Editors::Table)
        .and_where(Expr::col(Editors::Login).eq(login))
        .to_string(SqliteQueryBuilder)
}

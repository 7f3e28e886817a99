use sea_query::Iden;

/// Metadata table - key-value store for database configuration
#[derive(Iden)]
pub enum Metadata {
    Table,
    Key,
    Value,
}

/// Media table - immutable library records
#[derive(Iden)]
pub enum Media {
    Table,
    Id,
    Name,
    Author,
    DurationUs,
    SourceId,
}

/// Tags table - typed labels used to filter the AutoDJ library
#[derive(Iden)]
pub enum Tags {
    Table,
    Id,
    Name,
    Kind,
    /// JSON object of string pairs
    Metadata,
}

/// Media to tag relation
#[derive(Iden)]
pub enum MediaTags {
    Table,
    MediaId,
    TagId,
}

/// Segments table - timeline placements, times in microseconds
#[derive(Iden)]
pub enum Segments {
    Table,
    Id,
    MediaId,
    StartUs,
    BeginCutUs,
    StopCutUs,
    /// Derived `start_us + stop_cut_us - begin_cut_us`
    EndUs,
    Protected,
    LiveId,
}

/// Lives table - live capture sessions
#[derive(Iden)]
pub enum Lives {
    Table,
    Id,
    Name,
    StartUs,
    StopUs,
    DelayUs,
    OffsetUs,
}

/// Editors table - API accounts other than root
#[derive(Iden)]
pub enum Editors {
    Table,
    Id,
    Login,
    PassHash,
}

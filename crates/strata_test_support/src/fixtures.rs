use strata_core::{
    DefaultValue, FieldBuilder, ModelBuilder, Schema, SchemaBuilder, SqlProvider,
};

/// A blog-shaped schema: User 1:N Post, Post N:M Tag, User 1:1 Profile.
pub fn blog_schema(provider: SqlProvider) -> Schema {
    SchemaBuilder::new(provider)
        .model(
            ModelBuilder::new("User")
                .field(FieldBuilder::id_cuid("id"))
                .field(FieldBuilder::string("email").unique())
                .field(FieldBuilder::string("name").optional())
                .field(FieldBuilder::int("age").optional())
                .field(
                    FieldBuilder::date_time("createdAt").default(DefaultValue::Now),
                )
                .field(FieldBuilder::date_time("updatedAt").updated_at())
                .field(FieldBuilder::relation_many("posts", "Post", "author"))
                .field(FieldBuilder::relation_one("profile", "Profile", "user")),
        )
        .model(
            ModelBuilder::new("Post")
                .field(FieldBuilder::id_cuid("id"))
                .field(FieldBuilder::string("title"))
                .field(
                    FieldBuilder::boolean("published")
                        .default_value(strata_core::Value::Bool(false)),
                )
                .field(FieldBuilder::int("views").default_value(strata_core::Value::Int(0)))
                .field(FieldBuilder::string("authorId"))
                .field(FieldBuilder::relation_owner(
                    "author",
                    "User",
                    "posts",
                    &["authorId"],
                    &["id"],
                ))
                .field(FieldBuilder::relation_many("tags", "Tag", "posts")),
        )
        .model(
            ModelBuilder::new("Tag")
                .field(FieldBuilder::id_cuid("id"))
                .field(FieldBuilder::string("name").unique())
                .field(FieldBuilder::relation_many("posts", "Post", "tags")),
        )
        .model(
            ModelBuilder::new("Profile")
                .field(FieldBuilder::id_cuid("id"))
                .field(FieldBuilder::string("bio").optional())
                .field(FieldBuilder::string("userId").unique())
                .field(FieldBuilder::relation_owner(
                    "user",
                    "User",
                    "profile",
                    &["userId"],
                    &["id"],
                )),
        )
        .build()
        .expect("blog schema is valid")
}

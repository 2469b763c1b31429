use oso::PolarClass;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DRIVER_ROLE: &str = "driver";
pub const SYSTEM_ROLE: &str = "system";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub roles: Vec<String>,
}

impl User {
    pub fn new(id: Uuid) -> Self {
        Self { id, roles: vec![] }
    }

    pub fn new_system_user() -> Self {
        Self {
            id: Uuid::new_v4(),
            roles: vec![SYSTEM_ROLE.into()],
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for role in roles {
            let role = role.into();
            if !self.roles.contains(&role) {
                self.roles.push(role);
            }
        }
        self
    }

    pub fn has_role(&self, role: String) -> bool {
        self.roles.iter().any(|r| r == &role)
    }

    fn has_id(&self, id: Uuid) -> bool {
        self.id == id
    }
}

impl PolarClass for User {
    fn get_polar_class_builder() -> oso::ClassBuilder<User> {
        oso::Class::builder()
            .name("User")
            .add_attribute_getter("id", |recv: &User| recv.id)
            .add_attribute_getter("roles", |recv: &User| recv.roles.clone())
            .add_method("has_id", User::has_id)
            .add_method("has_role", User::has_role)
    }

    fn get_polar_class() -> oso::Class {
        let builder = User::get_polar_class_builder();
        builder.build()
    }
}

#[test]
fn roles_merge_without_duplicates() {
    let user = User::new(Uuid::new_v4())
        .with_roles(["driver"])
        .with_roles(vec!["driver".to_string(), "system".to_string()]);

    assert_eq!(user.roles, vec!["driver", "system"]);
    assert!(user.has_role(DRIVER_ROLE.into()));
    assert!(!User::new(Uuid::new_v4()).has_role(SYSTEM_ROLE.into()));
}

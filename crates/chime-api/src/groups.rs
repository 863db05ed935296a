use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use chime_db::Database;
use chime_db::queries;
use chime_types::models::{GroupRole, GroupSummary};
use chime_types::{GroupId, UserId};

use crate::error::{ServiceError, ServiceResult};

const NAME_MIN: usize = 2;
const NAME_MAX: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedGroup {
    pub group_id: GroupId,
    pub group_name: String,
    /// Members added besides the creator, deduplicated.
    pub members: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedMember {
    pub group_id: GroupId,
    pub group_name: String,
    pub user_id: UserId,
}

pub struct GroupService {
    db: Arc<Database>,
}

impl GroupService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Creates the group, its owner row and the initial member rows in one
    /// transaction. Any failure leaves nothing behind.
    pub fn create(
        &self,
        creator: UserId,
        name: &str,
        initial_members: &[UserId],
    ) -> ServiceResult<CreatedGroup> {
        let name = name.trim();
        let len = name.chars().count();
        if !(NAME_MIN..=NAME_MAX).contains(&len) {
            return Err(ServiceError::validation(format!(
                "group name must be {}-{} characters",
                NAME_MIN, NAME_MAX
            )));
        }

        let members: Vec<UserId> = initial_members
            .iter()
            .copied()
            .filter(|id| *id != creator)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let group_id = self.db.with_tx(|tx| -> ServiceResult<GroupId> {
            if !queries::user_exists(tx, creator)? {
                return Err(ServiceError::not_found("user not found"));
            }

            let group_id = queries::insert_group(tx, name, creator)?;
            queries::insert_owner(tx, group_id, creator)?;

            let missing = queries::missing_user_ids(tx, &members)?;
            if !missing.is_empty() {
                return Err(ServiceError::not_found(format!(
                    "unknown users: {}",
                    missing
                        .iter()
                        .map(|id| id.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }

            for &member in &members {
                queries::insert_member_ignore(tx, group_id, member)?;
            }
            Ok(group_id)
        })?;

        info!(
            "Group {} '{}' created by {} with {} members",
            group_id,
            name,
            creator,
            members.len() + 1
        );
        Ok(CreatedGroup {
            group_id,
            group_name: name.to_string(),
            members,
        })
    }

    pub fn add_member(
        &self,
        group_id: GroupId,
        new_user: UserId,
        inviter: UserId,
    ) -> ServiceResult<AddedMember> {
        let group_name = self.db.with_tx(|tx| -> ServiceResult<String> {
            // Non-members learn nothing about whether the group exists.
            let role = queries::member_role(tx, group_id, inviter)?
                .ok_or_else(|| ServiceError::not_found("group not found"))?;
            let may_invite = role
                .parse::<GroupRole>()
                .is_ok_and(GroupRole::can_invite);
            if !may_invite {
                return Err(ServiceError::auth("only owners and admins can add members"));
            }
            let group = queries::get_group(tx, group_id)?
                .ok_or_else(|| ServiceError::not_found("group not found"))?;

            if !queries::user_exists(tx, new_user)? {
                return Err(ServiceError::not_found("user not found"));
            }
            if !queries::insert_member_ignore(tx, group_id, new_user)? {
                return Err(ServiceError::conflict("user is already a member"));
            }
            Ok(group.name)
        })?;

        info!("User {} added to group {} by {}", new_user, group_id, inviter);
        Ok(AddedMember {
            group_id,
            group_name,
            user_id: new_user,
        })
    }

    pub fn list_for_user(&self, user_id: UserId) -> ServiceResult<Vec<GroupSummary>> {
        let rows = self.db.groups_for_user(user_id)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.role.parse::<GroupRole>() {
                Ok(role) => Some(GroupSummary {
                    group_id: row.group_id,
                    group_name: row.group_name,
                    role,
                    member_count: row.member_count,
                }),
                Err(e) => {
                    warn!("Skipping membership in group {}: {}", row.group_id, e);
                    None
                }
            })
            .collect())
    }

    pub fn group_ids_for_user(&self, user_id: UserId) -> ServiceResult<Vec<GroupId>> {
        Ok(self.db.group_ids_for_user(user_id)?)
    }

    pub fn member_ids(&self, group_id: GroupId) -> ServiceResult<Vec<UserId>> {
        Ok(self.db.group_member_ids(group_id)?)
    }

    pub fn is_member(&self, group_id: GroupId, user_id: UserId) -> ServiceResult<bool> {
        Ok(self.db.is_group_member(group_id, user_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(n: usize) -> (GroupService, Arc<Database>, Vec<UserId>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let ids = (0..n)
            .map(|i| db.create_user(&format!("user{}", i), "s$d", None).unwrap())
            .collect();
        (GroupService::new(db.clone()), db, ids)
    }

    #[test]
    fn creator_owns_and_members_are_deduplicated() {
        let (svc, db, ids) = service(3);
        let (owner, b, c) = (ids[0], ids[1], ids[2]);

        let created = svc.create(owner, "  Team  ", &[owner, b, b, c]).unwrap();
        assert_eq!(created.group_name, "Team");
        assert_eq!(created.members, vec![b, c]);

        assert_eq!(
            db.member_role(created.group_id, owner).unwrap().as_deref(),
            Some("owner")
        );
        for id in [b, c] {
            assert_eq!(
                db.member_role(created.group_id, id).unwrap().as_deref(),
                Some("member")
            );
        }
        assert_eq!(svc.member_ids(created.group_id).unwrap().len(), 3);
    }

    #[test]
    fn unknown_member_rolls_back_everything() {
        let (svc, db, ids) = service(2);

        let err = svc.create(ids[0], "Team", &[ids[1], 9999]).unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert!(svc.list_for_user(ids[0]).unwrap().is_empty());
        assert!(db.get_group(1).unwrap().is_none());
    }

    #[test]
    fn name_and_creator_validation() {
        let (svc, _, ids) = service(1);
        assert!(matches!(svc.create(ids[0], " x ", &[]), Err(ServiceError::Validation(_))));
        let long = "n".repeat(65);
        assert!(matches!(svc.create(ids[0], &long, &[]), Err(ServiceError::Validation(_))));
        assert!(matches!(svc.create(4242, "Team", &[]), Err(ServiceError::NotFound(_))));
    }

    #[test]
    fn only_owner_or_admin_may_invite() {
        let (svc, _, ids) = service(3);
        let created = svc.create(ids[0], "Team", &[ids[1]]).unwrap();
        let gid = created.group_id;

        let err = svc.add_member(gid, ids[2], ids[1]).unwrap_err();
        assert!(matches!(err, ServiceError::Auth(_)));

        let added = svc.add_member(gid, ids[2], ids[0]).unwrap();
        assert_eq!(added.group_name, "Team");
        assert!(svc.is_member(gid, ids[2]).unwrap());

        let err = svc.add_member(gid, ids[2], ids[0]).unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        assert!(matches!(
            svc.add_member(gid, 777, ids[0]),
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            svc.add_member(gid + 1, ids[2], ids[0]),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn outsider_cannot_tell_missing_group_from_foreign_one() {
        let (svc, _, ids) = service(3);
        let created = svc.create(ids[0], "Team", &[ids[1]]).unwrap();

        let foreign = svc.add_member(created.group_id, ids[1], ids[2]).unwrap_err();
        let missing = svc.add_member(created.group_id + 50, ids[1], ids[2]).unwrap_err();
        assert!(matches!(foreign, ServiceError::NotFound(_)));
        assert_eq!(foreign.to_string(), missing.to_string());
        assert!(!svc.is_member(created.group_id, ids[2]).unwrap());
    }

    #[test]
    fn listing_carries_role_and_live_count() {
        let (svc, _, ids) = service(3);
        let created = svc.create(ids[0], "Team", &[ids[1]]).unwrap();

        let listed = svc.list_for_user(ids[1]).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].role, GroupRole::Member);
        assert_eq!(listed[0].member_count, 2);

        svc.add_member(created.group_id, ids[2], ids[0]).unwrap();
        assert_eq!(svc.list_for_user(ids[0]).unwrap()[0].member_count, 3);
        assert_eq!(svc.group_ids_for_user(ids[2]).unwrap(), vec![created.group_id]);
    }
}
